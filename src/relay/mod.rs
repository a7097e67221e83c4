//! Relay: one session fanned out to one or more named pipes.
//!
//! Each event is encoded once and the same record is written to every
//! target in configuration order. Failures on one target never stop delivery
//! to the others; they are collected and surfaced together.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{encode, EncodingError};
use crate::domain::{Event, EventKind, PipeTarget, Session};
use crate::pipe::{PipeError, PipeWriter, WriterOptions, WriterState};

/// A pipe target that failed to accept a record
#[derive(Debug)]
pub struct TargetFailure {
    pub target: PipeTarget,
    pub error: PipeError,
}

impl TargetFailure {
    /// Whether the reader went away (the target can be reopened)
    pub fn is_disconnect(&self) -> bool {
        matches!(self.error, PipeError::BrokenPipe(_) | PipeError::Closed(_))
    }
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.error)
    }
}

/// Errors publishing through a relay
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to encode event: {0}")]
    Encoding(#[from] EncodingError),

    #[error("No pipe targets configured")]
    NoTargets,

    #[error("Unknown pipe target: {0}")]
    UnknownTarget(PipeTarget),

    #[error("Failed to open {target}: {source}")]
    Open {
        target: PipeTarget,
        #[source]
        source: PipeError,
    },

    #[error("Delivery failed for {} target(s): {}", .0.len(), describe(.0))]
    Delivery(Vec<TargetFailure>),
}

impl RelayError {
    /// Per-target failures, if this was a delivery error
    pub fn failures(&self) -> &[TargetFailure] {
        match self {
            Self::Delivery(failures) => failures,
            _ => &[],
        }
    }
}

fn describe(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Anything a host collaborator can hand events to
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Session stamped onto events built for this sink
    fn session(&self) -> &Session;

    /// Deliver one event
    async fn publish(&self, event: &Event) -> Result<(), RelayError>;
}

#[async_trait]
impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn session(&self) -> &Session {
        (**self).session()
    }

    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        (**self).publish(event).await
    }
}

/// Session-bound fan-out over pipe writers
pub struct Relay {
    session: Session,
    writers: Vec<PipeWriter>,
    options: WriterOptions,
}

impl Relay {
    /// Open a writer for every target, in order.
    ///
    /// If any target fails to open, the ones already opened are closed again.
    pub async fn connect(
        session: Session,
        targets: Vec<PipeTarget>,
        options: WriterOptions,
    ) -> Result<Self, RelayError> {
        if targets.is_empty() {
            return Err(RelayError::NoTargets);
        }

        let mut writers: Vec<PipeWriter> = Vec::with_capacity(targets.len());

        for target in targets {
            match PipeWriter::open(target.clone(), options.clone()).await {
                Ok(writer) => writers.push(writer),
                Err(source) => {
                    for writer in &writers {
                        let _ = writer.close().await;
                    }
                    return Err(RelayError::Open { target, source });
                }
            }
        }

        debug!(session = %session, targets = writers.len(), "Relay connected");

        Ok(Self {
            session,
            writers,
            options,
        })
    }

    /// Build a relay over writers the caller already manages
    pub fn from_writers(session: Session, writers: Vec<PipeWriter>, options: WriterOptions) -> Self {
        Self {
            session,
            writers,
            options,
        }
    }

    pub fn targets(&self) -> impl Iterator<Item = &PipeTarget> {
        self.writers.iter().map(PipeWriter::target)
    }

    /// Start an event stamped with this relay's session
    pub fn event(&self, kind: EventKind) -> Event {
        Event::new(kind, &self.session)
    }

    /// Deliver an event to a single target only
    pub async fn publish_to(&self, target: &PipeTarget, event: &Event) -> Result<(), RelayError> {
        let record = encode(event)?;
        let writer = self.writer(target)?;

        writer.write(&record).await.map_err(|error| {
            RelayError::Delivery(vec![TargetFailure {
                target: target.clone(),
                error,
            }])
        })
    }

    /// Replace a target's closed writer with a freshly opened one
    pub async fn reopen(&mut self, target: &PipeTarget) -> Result<(), RelayError> {
        let index = self
            .writers
            .iter()
            .position(|w| w.target() == target)
            .ok_or_else(|| RelayError::UnknownTarget(target.clone()))?;

        if self.writers[index].state().await == WriterState::Open {
            return Ok(());
        }

        let writer = PipeWriter::open(target.clone(), self.options.clone())
            .await
            .map_err(|source| RelayError::Open {
                target: target.clone(),
                source,
            })?;

        debug!(pipe = %target, "Reopened named pipe");
        self.writers[index] = writer;
        Ok(())
    }

    /// Close every writer, flushing first
    pub async fn close(&self) -> Result<(), RelayError> {
        let mut failures = Vec::new();

        for writer in &self.writers {
            if let Err(error) = writer.close().await {
                failures.push(TargetFailure {
                    target: writer.target().clone(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RelayError::Delivery(failures))
        }
    }

    fn writer(&self, target: &PipeTarget) -> Result<&PipeWriter, RelayError> {
        self.writers
            .iter()
            .find(|w| w.target() == target)
            .ok_or_else(|| RelayError::UnknownTarget(target.clone()))
    }
}

#[async_trait]
impl EventSink for Relay {
    fn session(&self) -> &Session {
        &self.session
    }

    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        let record = encode(event)?;
        let mut failures = Vec::new();

        for writer in &self.writers {
            if let Err(error) = writer.write(&record).await {
                warn!(pipe = %writer.target(), kind = %event.kind, error = %error, "Delivery failed");
                failures.push(TargetFailure {
                    target: writer.target().clone(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RelayError::Delivery(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_requires_targets() {
        let result = Relay::connect(Session::generate(), Vec::new(), WriterOptions::default()).await;
        assert!(matches!(result, Err(RelayError::NoTargets)));
    }

    #[tokio::test]
    async fn test_encoding_errors_surface_before_delivery() {
        let relay = Relay::from_writers(Session::generate(), Vec::new(), WriterOptions::default());
        let event = relay.event(EventKind::TaskOk).with_field("bad", f64::INFINITY);

        let err = relay.publish(&event).await.unwrap_err();
        assert!(matches!(err, RelayError::Encoding(_)));
    }

    #[tokio::test]
    async fn test_unopened_writers_report_per_target_failures() {
        let session = Session::generate();
        let writers = vec![
            PipeWriter::new(PipeTarget::new("/tmp/a.fifo"), WriterOptions::default()),
            PipeWriter::new(PipeTarget::new("/tmp/b.fifo"), WriterOptions::default()),
        ];
        let relay = Relay::from_writers(session, writers, WriterOptions::default());

        let err = relay.publish(&relay.event(EventKind::TaskStart)).await.unwrap_err();
        let failures = err.failures();

        assert_eq!(failures.len(), 2);
        assert!(matches!(failures[0].error, PipeError::NotOpen(_)));
        assert!(!failures[0].is_disconnect());
    }

    #[tokio::test]
    async fn test_event_is_stamped_with_session() {
        let session = Session::from_id("run-7").unwrap();
        let relay = Relay::from_writers(session, Vec::new(), WriterOptions::default());
        assert_eq!(relay.event(EventKind::PlayStart).session_id, "run-7");
    }

    #[tokio::test]
    async fn test_publish_to_unknown_target() {
        let relay = Relay::from_writers(Session::generate(), Vec::new(), WriterOptions::default());
        let event = relay.event(EventKind::TaskOk);
        let err = relay
            .publish_to(&PipeTarget::new("/tmp/x"), &event)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownTarget(_)));
    }
}
