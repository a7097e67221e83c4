//! Lifecycle event types relayed to named-pipe consumers.
//!
//! Events are immutable once built: the builder methods consume `self` and
//! the fields are only readable through accessors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::session::Session;

/// A single lifecycle event raised by a host collaborator.
///
/// Fields are kept in a `BTreeMap` so iteration order is the sorted key order
/// the wire format requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub(crate) kind: EventKind,
    pub(crate) session_id: String,
    pub(crate) timestamp: DateTime<Utc>,
    #[serde(default)]
    pub(crate) fields: BTreeMap<String, FieldValue>,
}

impl Event {
    /// Create a new event stamped with the current time
    pub fn new(kind: EventKind, session: &Session) -> Self {
        Self::with_session_id(kind, session.id())
    }

    /// Create a new event for a raw session id (used by decoders and tests)
    pub fn with_session_id(kind: EventKind, session_id: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            timestamp: Utc::now().trunc_subsecs(3),
            fields: BTreeMap::new(),
        }
    }

    /// Override the timestamp (truncated to milliseconds)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.trunc_subsecs(3);
        self
    }

    /// Add a field, replacing any previous value under the same key
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Add every field from `fields`, replacing existing keys
    pub fn with_fields(mut self, fields: BTreeMap<String, FieldValue>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Add a field only when a value is present
    pub fn with_optional_field(
        self,
        key: impl Into<String>,
        value: Option<impl Into<FieldValue>>,
    ) -> Self {
        match value {
            Some(value) => self.with_field(key, value),
            None => self,
        }
    }

    /// What happened
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Session this event belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// When the event was raised
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Payload fields in key order
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Look up a field by key
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Timestamp as milliseconds since the Unix epoch
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Kind tag of a lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventKind {
    /// A play has started
    PlayStart,

    /// A task has started on a host
    TaskStart,

    /// A task has finished on a host
    TaskEnd,

    /// A task succeeded
    TaskOk,

    /// A task failed
    TaskFailed,

    /// The task's host could not be reached
    TaskUnreachable,

    /// A task was skipped
    TaskSkipped,

    /// A loop item succeeded
    ItemOk,

    /// A loop item failed
    ItemFailed,

    /// A loop item was skipped
    ItemSkipped,

    /// A loop item is being retried
    ItemRetry,

    /// Per-host summary statistics
    HostStats,

    /// The whole playbook finished
    PlaybookEnd,

    /// Any other well-formed tag
    Custom(String),
}

impl EventKind {
    /// Wire tag for this kind
    pub fn as_str(&self) -> &str {
        match self {
            Self::PlayStart => "play-start",
            Self::TaskStart => "task-start",
            Self::TaskEnd => "task-end",
            Self::TaskOk => "task-ok",
            Self::TaskFailed => "task-failed",
            Self::TaskUnreachable => "task-unreachable",
            Self::TaskSkipped => "task-skipped",
            Self::ItemOk => "item-ok",
            Self::ItemFailed => "item-failed",
            Self::ItemSkipped => "item-skipped",
            Self::ItemRetry => "item-retry",
            Self::HostStats => "host-stats",
            Self::PlaybookEnd => "playbook-end",
            Self::Custom(tag) => tag,
        }
    }
}

/// Error parsing an event kind tag
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KindError {
    #[error("Event kind must not be empty")]
    Empty,

    #[error("Invalid character {ch:?} in event kind {tag:?}")]
    InvalidChar { tag: String, ch: char },
}

impl FromStr for EventKind {
    type Err = KindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "play-start" => Self::PlayStart,
            "task-start" => Self::TaskStart,
            "task-end" => Self::TaskEnd,
            "task-ok" => Self::TaskOk,
            "task-failed" => Self::TaskFailed,
            "task-unreachable" => Self::TaskUnreachable,
            "task-skipped" => Self::TaskSkipped,
            "item-ok" => Self::ItemOk,
            "item-failed" => Self::ItemFailed,
            "item-skipped" => Self::ItemSkipped,
            "item-retry" => Self::ItemRetry,
            "host-stats" => Self::HostStats,
            "playbook-end" => Self::PlaybookEnd,
            "" => return Err(KindError::Empty),
            other => {
                if let Some(ch) = other.chars().find(|c| !is_tag_char(*c)) {
                    return Err(KindError::InvalidChar {
                        tag: other.to_string(),
                        ch,
                    });
                }
                Self::Custom(other.to_string())
            }
        };
        Ok(kind)
    }
}

/// Characters allowed in kind tags and field keys
pub(crate) fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for EventKind {
    type Error = KindError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Scalar value carried in an event's fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    /// Borrow the string payload, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer payload, if this is an integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Infer a typed value from bare text.
    ///
    /// `true`/`false` become booleans, decimal integers become `Int`, finite
    /// numbers with a fraction or exponent become `Float`, everything else
    /// stays a string.
    pub fn infer(text: &str) -> Self {
        match text {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }

        if looks_numeric(text) {
            if let Ok(n) = text.parse::<i64>() {
                return Self::Int(n);
            }
            if let Ok(f) = text.parse::<f64>() {
                if f.is_finite() {
                    return Self::Float(f);
                }
            }
        }

        Self::Str(text.to_string())
    }
}

/// Cheap pre-check so words like "inf" or "NaN" stay strings
fn looks_numeric(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    digits.starts_with(|c: char| c.is_ascii_digit())
        && digits
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '-' | '+'))
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(n) => write!(f, "{}", n),
            Self::Float(x) => write!(f, "{:?}", x),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&String> for FieldValue {
    fn from(s: &String) -> Self {
        Self::Str(s.clone())
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<u32> for FieldValue {
    fn from(n: u32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<f64> for FieldValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}
