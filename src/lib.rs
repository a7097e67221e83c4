//! piperelay - Ordered lifecycle event relay to named pipes
//!
//! Host collaborators raise structured lifecycle events; the relay renders
//! each one as a single escaped `key=value` line and appends it, whole and
//! in order, to one or more pre-existing named pipes.
//!
//! # Architecture
//!
//! - Encoder/decoder are pure functions over `Event`
//! - `PipeWriter` is the only stateful piece: one per pipe, writes serialized
//! - The session id is explicit state passed in at startup, never a global
//! - Nothing is retried internally; retry policy belongs to the host
//!
//! # Modules
//!
//! - `codec`: Wire format (encode, decode, streaming reader)
//! - `pipe`: Named pipe writer and open modes
//! - `relay`: Session-bound fan-out and the `EventSink` trait
//! - `lifecycle`: Host-side reporter for play/task/item callbacks
//! - `domain`: Data structures (Event, Session, PipeTarget)
//! - `config`: Layered configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! mkfifo /tmp/status.fifo
//! piperelay decode --input /tmp/status.fifo &
//! piperelay --pipe /tmp/status.fifo emit task-start -f name=deploy
//! ```

pub mod cli;
pub mod codec;
pub mod config;
pub mod domain;
pub mod lifecycle;
pub mod pipe;
pub mod relay;

// Re-export main types at crate root for convenience
pub use codec::{decode, encode, DecodeError, EncodingError, RecordReader};
pub use domain::{Event, EventKind, FieldValue, PipeTarget, Session};
pub use lifecycle::{HostStats, LifecycleReporter, Status, TaskResult};
pub use pipe::{OpenMode, PipeError, PipeWriter, WriterOptions, WriterState};
pub use relay::{EventSink, Relay, RelayError, TargetFailure};
