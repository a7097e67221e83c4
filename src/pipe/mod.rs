//! Named pipe delivery.
//!
//! `PipeWriter` is the only stateful piece of the relay: it owns the pipe
//! descriptor and serializes writes so each record lands whole.

pub mod writer;

pub use writer::{OpenMode, PipeError, PipeWriter, WriterOptions, WriterState};
