//! Session identity shared by every event of one relay run.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors validating an externally supplied session id
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session id must not be empty")]
    Empty,

    #[error("Session id must not contain whitespace: {0:?}")]
    Whitespace(String),
}

/// Opaque token grouping all events emitted during one run.
///
/// Either supplied by the host or generated once at startup and then passed
/// around explicitly. There is no process-global session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Session {
    id: String,
}

impl Session {
    /// Generate a fresh random session (UUID v4)
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
        }
    }

    /// Use an externally supplied id
    pub fn from_id(id: impl Into<String>) -> Result<Self, SessionError> {
        let id = id.into();
        if id.is_empty() {
            return Err(SessionError::Empty);
        }
        if id.chars().any(char::is_whitespace) {
            return Err(SessionError::Whitespace(id));
        }
        Ok(Self { id })
    }

    /// Use the supplied id if present, otherwise generate one
    pub fn resolve(id: Option<String>) -> Result<Self, SessionError> {
        match id {
            Some(id) => Self::from_id(id),
            None => Ok(Self::generate()),
        }
    }

    /// The session token
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl TryFrom<String> for Session {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_id(value)
    }
}

impl From<Session> for String {
    fn from(session: Session) -> Self {
        session.id
    }
}
