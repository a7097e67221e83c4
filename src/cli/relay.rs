//! `piperelay relay`: stream JSON events from stdin into the pipes.
//!
//! Each input line is a JSON object:
//!
//! ```json
//! {"kind": "task-ok", "fields": {"task": "deploy", "changed": true}}
//! ```
//!
//! The relay's session and the current time are stamped on every event.
//! Retry policy for vanished readers lives here, not in the relay core.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::ResolvedConfig;
use crate::domain::{Event, EventKind, FieldValue};
use crate::relay::{EventSink, Relay, RelayError};

/// What to do when a target's reader disconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BrokenPipePolicy {
    /// Stop relaying and exit with an error
    Fail,

    /// Drop the event for that target, then reopen it for later events
    Drop,

    /// Reopen the target and deliver the event again
    Retry,
}

/// One line of relay input
#[derive(Debug, Deserialize)]
pub struct InputEvent {
    pub kind: EventKind,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl InputEvent {
    /// Stamp with the relay's session and the current time
    pub fn into_event(self, relay: &Relay) -> Event {
        relay.event(self.kind).with_fields(self.fields)
    }
}

/// Counters reported when the input ends
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    /// Delivered to every target
    pub published: u64,

    /// Delivered to some targets, dropped for the rest
    pub partial: u64,

    /// Delivered nowhere
    pub dropped: u64,

    /// Input lines that were not valid events
    pub rejected: u64,
}

pub async fn run(config: &ResolvedConfig, policy: BrokenPipePolicy) -> Result<()> {
    let mut relay = super::connect(config).await?;
    info!(session = %relay.session(), "Relaying events from stdin");

    let streamed = stream(&mut relay, BufReader::new(tokio::io::stdin()), policy).await;
    let closed = relay.close().await;

    let summary = streamed?;
    closed.context("Failed to close named pipes")?;

    info!(
        published = summary.published,
        partial = summary.partial,
        dropped = summary.dropped,
        rejected = summary.rejected,
        "Input finished"
    );
    Ok(())
}

/// Publish every line of `input` through `relay`
pub async fn stream<R>(relay: &mut Relay, input: R, policy: BrokenPipePolicy) -> Result<RelaySummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = RelaySummary::default();
    let mut lines = input.lines();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let input: InputEvent = match serde_json::from_str(&line) {
            Ok(input) => input,
            Err(e) => {
                warn!(line = line_no, error = %e, "Rejected malformed input");
                summary.rejected += 1;
                continue;
            }
        };

        let event = input.into_event(relay);

        match relay.publish(&event).await {
            Ok(()) => summary.published += 1,
            Err(RelayError::Encoding(e)) => {
                warn!(line = line_no, error = %e, "Dropped unencodable event");
                summary.dropped += 1;
            }
            Err(err) => {
                recover(relay, err, &event, policy, &mut summary).await?;
            }
        }
    }

    Ok(summary)
}

/// Apply the broken-pipe policy to a failed delivery.
///
/// Under `Drop` a target that cannot be reopened yet stays closed and is
/// tried again on the next event.
async fn recover(
    relay: &mut Relay,
    err: RelayError,
    event: &Event,
    policy: BrokenPipePolicy,
    summary: &mut RelaySummary,
) -> Result<()> {
    let recoverable = policy != BrokenPipePolicy::Fail
        && !err.failures().is_empty()
        && err.failures().iter().all(|f| f.is_disconnect());

    if !recoverable {
        return Err(err).context("Failed to publish event");
    }

    for failure in err.failures() {
        let target = &failure.target;

        if policy == BrokenPipePolicy::Retry {
            relay
                .reopen(target)
                .await
                .with_context(|| format!("Failed to reopen {}", target))?;
            relay
                .publish_to(target, event)
                .await
                .with_context(|| format!("Retry failed for {}", target))?;
            continue;
        }

        warn!(pipe = %target, kind = %event.kind(), "Dropped event after disconnect");
        if let Err(e) = relay.reopen(target).await {
            warn!(pipe = %target, error = %e, "Target still unavailable");
        }
    }

    let missed = err.failures().len();
    if policy == BrokenPipePolicy::Retry {
        summary.published += 1;
    } else if missed < relay.targets().count() {
        summary.partial += 1;
    } else {
        summary.dropped += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Session;
    use crate::pipe::WriterOptions;

    #[test]
    fn test_input_event_parsing() {
        let input: InputEvent = serde_json::from_str(
            r#"{"kind": "task-ok", "fields": {"task": "deploy", "changed": true, "attempt": 2}}"#,
        )
        .unwrap();

        assert_eq!(input.kind, EventKind::TaskOk);
        assert_eq!(input.fields.get("changed"), Some(&FieldValue::Bool(true)));
        assert_eq!(input.fields.get("attempt"), Some(&FieldValue::Int(2)));
    }

    #[test]
    fn test_input_event_rejects_bad_kind() {
        assert!(serde_json::from_str::<InputEvent>(r#"{"kind": ""}"#).is_err());
        assert!(serde_json::from_str::<InputEvent>(r#"{"kind": "a b"}"#).is_err());
    }

    #[tokio::test]
    async fn test_stream_counts_rejected_and_dropped() {
        let mut relay =
            Relay::from_writers(Session::generate(), Vec::new(), WriterOptions::default());
        let input: &[u8] = b"not json\n\n{\"kind\": \"task-ok\", \"fields\": {\"kind\": \"x\"}}\n{\"kind\": \"task-ok\"}\n";

        let summary = stream(&mut relay, input, BrokenPipePolicy::Fail).await.unwrap();

        assert_eq!(
            summary,
            RelaySummary {
                published: 1,
                partial: 0,
                dropped: 1,
                rejected: 1,
            }
        );
    }
}
