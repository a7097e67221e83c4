//! Domain types for the relay.
//!
//! - Events: Immutable lifecycle notifications
//! - Session: Identity tying a run's events together
//! - Target: Named pipe a writer delivers to

pub mod events;
pub mod session;
pub mod target;

// Re-export commonly used types
pub use events::{Event, EventKind, FieldValue, KindError};
pub use session::{Session, SessionError};
pub use target::PipeTarget;
