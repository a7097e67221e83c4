//! Event → wire record encoding.
//!
//! A record is one line of space separated `key=value` pairs:
//!
//! ```text
//! kind=task-start session_id=abc timestamp=1000 name=deploy
//! ```
//!
//! The header keys come first in fixed order, then fields sorted by key.
//! Values are escaped so the only raw spaces are separators, the only raw
//! `=` are key/value separators and the only raw newline is the terminator.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::events::is_tag_char;
use crate::domain::{Event, EventKind, FieldValue, KindError};

/// Header keys that fields may not shadow
pub const RESERVED_KEYS: [&str; 3] = ["kind", "session_id", "timestamp"];

/// Errors rendering an event
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodingError {
    #[error("Event kind must not be empty")]
    EmptyKind,

    #[error("Event kind {0:?} would not read back as the same kind")]
    InvalidKind(String),

    #[error("Timestamp {0} is finer than millisecond precision")]
    SubMillisecondTimestamp(DateTime<Utc>),

    #[error("Session id must not be empty")]
    EmptySessionId,

    #[error("Invalid field key {0:?}")]
    InvalidKey(String),

    #[error("Field key {0:?} is reserved for the record header")]
    ReservedKey(String),

    #[error("Value for {key:?} contains unrepresentable control character {ch:?}")]
    ControlCharacter { key: String, ch: char },

    #[error("Value for {key:?} is not a finite number: {value}")]
    NonFiniteFloat { key: String, value: f64 },
}

/// Encode an event as one newline-terminated record
pub fn encode(event: &Event) -> Result<Vec<u8>, EncodingError> {
    encode_to_string(event).map(String::into_bytes)
}

/// Encode an event as one newline-terminated record
pub fn encode_to_string(event: &Event) -> Result<String, EncodingError> {
    let kind = validate_kind(&event.kind)?;
    if event.session_id.is_empty() {
        return Err(EncodingError::EmptySessionId);
    }
    if event.timestamp.timestamp_subsec_nanos() % 1_000_000 != 0 {
        return Err(EncodingError::SubMillisecondTimestamp(event.timestamp));
    }

    let mut out = String::with_capacity(64 + event.fields.len() * 16);

    out.push_str("kind=");
    escape_into("kind", kind, &mut out)?;
    out.push_str(" session_id=");
    escape_into("session_id", &event.session_id, &mut out)?;
    out.push_str(" timestamp=");
    out.push_str(&event.timestamp_millis().to_string());

    for (key, value) in &event.fields {
        validate_key(key)?;
        out.push(' ');
        out.push_str(key);
        out.push('=');
        render_value(key, value, &mut out)?;
    }

    out.push('\n');
    Ok(out)
}

/// A `Custom` kind must not spell a known tag or carry characters the
/// decoder rejects.
fn validate_kind(kind: &EventKind) -> Result<&str, EncodingError> {
    let tag = kind.as_str();
    match tag.parse::<EventKind>() {
        Ok(parsed) if parsed == *kind => Ok(tag),
        Err(KindError::Empty) => Err(EncodingError::EmptyKind),
        _ => Err(EncodingError::InvalidKind(tag.to_string())),
    }
}

fn validate_key(key: &str) -> Result<(), EncodingError> {
    if RESERVED_KEYS.contains(&key) {
        return Err(EncodingError::ReservedKey(key.to_string()));
    }
    if key.is_empty() || !key.chars().all(is_tag_char) {
        return Err(EncodingError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn render_value(key: &str, value: &FieldValue, out: &mut String) -> Result<(), EncodingError> {
    match value {
        FieldValue::Bool(_) | FieldValue::Int(_) => out.push_str(&value.to_string()),
        FieldValue::Float(x) => {
            if !x.is_finite() {
                return Err(EncodingError::NonFiniteFloat {
                    key: key.to_string(),
                    value: *x,
                });
            }
            out.push_str(&value.to_string());
        }
        FieldValue::Str(s) => {
            // Quote strings that would otherwise read back as another scalar
            let quoted = !matches!(FieldValue::infer(s), FieldValue::Str(_));
            if quoted {
                out.push('"');
            }
            escape_into(key, s, out)?;
            if quoted {
                out.push('"');
            }
        }
    }
    Ok(())
}

fn escape_into(key: &str, value: &str, out: &mut String) -> Result<(), EncodingError> {
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '=' => out.push_str("\\e"),
            '"' => out.push_str("\\q"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_ascii_control() => {
                return Err(EncodingError::ControlCharacter {
                    key: key.to_string(),
                    ch: c,
                });
            }
            c => out.push(c),
        }
    }
    Ok(())
}
