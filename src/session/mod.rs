//! Session management
//!
//! Tracks the state of each server-side connection and the context handed
//! to handler callbacks.

pub mod context;
pub mod state;

pub use context::SessionContext;
pub use state::{SessionPhase, SessionState};
