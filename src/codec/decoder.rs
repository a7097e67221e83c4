//! Wire record → Event decoding.
//!
//! The exact inverse of the encoder. Decoding is strict: records that the
//! encoder could not have produced are rejected rather than guessed at.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use super::encoder::RESERVED_KEYS;
use crate::domain::events::is_tag_char;
use crate::domain::{Event, EventKind, FieldValue, KindError};

/// Errors parsing a wire record
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Empty record")]
    Empty,

    #[error("Record is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed pair {0:?}: expected key=value")]
    MalformedPair(String),

    #[error("Expected header key {expected:?}, found {found:?}")]
    MissingHeader { expected: &'static str, found: String },

    #[error("Invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("Invalid event kind: {0}")]
    InvalidKind(#[from] KindError),

    #[error("Invalid field key {0:?}")]
    InvalidKey(String),

    #[error("Field key {key:?} is duplicated or out of order after {previous:?}")]
    FieldOrder { key: String, previous: String },

    #[error("Invalid escape sequence in {0:?}")]
    InvalidEscape(String),

    #[error("Unexpected quote in {0:?}")]
    UnexpectedQuote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode one record, with or without its trailing newline
pub fn decode(record: &[u8]) -> Result<Event, DecodeError> {
    let text = std::str::from_utf8(record).map_err(|_| DecodeError::InvalidUtf8)?;
    decode_str(text)
}

/// Decode one record from text
pub fn decode_str(record: &str) -> Result<Event, DecodeError> {
    let line = record.strip_suffix('\n').unwrap_or(record);
    if line.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut pairs = line.split(' ').map(split_pair);

    let kind = unescape(header(&mut pairs, "kind")?)?;
    let kind: EventKind = kind.parse()?;

    let session_id = unescape(header(&mut pairs, "session_id")?)?;

    let raw_ts = header(&mut pairs, "timestamp")?;
    let millis: i64 = raw_ts
        .parse()
        .map_err(|_| DecodeError::InvalidTimestamp(raw_ts.to_string()))?;
    let timestamp = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| DecodeError::InvalidTimestamp(raw_ts.to_string()))?;

    let mut fields = BTreeMap::new();
    let mut previous: Option<&str> = None;

    for pair in pairs {
        let (key, raw) = pair?;
        if key.is_empty() || !key.chars().all(is_tag_char) || RESERVED_KEYS.contains(&key) {
            return Err(DecodeError::InvalidKey(key.to_string()));
        }
        if let Some(prev) = previous {
            if key <= prev {
                return Err(DecodeError::FieldOrder {
                    key: key.to_string(),
                    previous: prev.to_string(),
                });
            }
        }
        previous = Some(key);
        fields.insert(key.to_string(), parse_value(raw)?);
    }

    Ok(Event {
        kind,
        session_id,
        timestamp,
        fields,
    })
}

fn split_pair(token: &str) -> Result<(&str, &str), DecodeError> {
    token
        .split_once('=')
        .ok_or_else(|| DecodeError::MalformedPair(token.to_string()))
}

fn header<'a, I>(pairs: &mut I, expected: &'static str) -> Result<&'a str, DecodeError>
where
    I: Iterator<Item = Result<(&'a str, &'a str), DecodeError>>,
{
    match pairs.next() {
        Some(pair) => {
            let (key, value) = pair?;
            if key != expected {
                return Err(DecodeError::MissingHeader {
                    expected,
                    found: key.to_string(),
                });
            }
            Ok(value)
        }
        None => Err(DecodeError::MissingHeader {
            expected,
            found: String::new(),
        }),
    }
}

fn parse_value(raw: &str) -> Result<FieldValue, DecodeError> {
    if let Some(rest) = raw.strip_prefix('"') {
        let inner = rest
            .strip_suffix('"')
            .ok_or_else(|| DecodeError::UnexpectedQuote(raw.to_string()))?;
        return Ok(FieldValue::Str(unescape(inner)?));
    }
    Ok(FieldValue::infer(&unescape(raw)?))
}

fn unescape(raw: &str) -> Result<String, DecodeError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                let decoded = match chars.next() {
                    Some('\\') => '\\',
                    Some('s') => ' ',
                    Some('e') => '=',
                    Some('q') => '"',
                    Some('n') => '\n',
                    Some('r') => '\r',
                    Some('t') => '\t',
                    _ => return Err(DecodeError::InvalidEscape(raw.to_string())),
                };
                out.push(decoded);
            }
            '"' => return Err(DecodeError::UnexpectedQuote(raw.to_string())),
            c => out.push(c),
        }
    }

    Ok(out)
}

/// Reads newline-delimited records from a stream, e.g. the consumer end of a pipe
pub struct RecordReader<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Next decoded event, or `None` once the writer side has closed
    pub async fn next_event(&mut self) -> Result<Option<Event>, DecodeError> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return decode_str(&line).map(Some);
        }
        Ok(None)
    }
}
