//! Shared wire-protocol and session data types for the Cutline client.
//!
//! Everything here mirrors the server's JSON shapes. The engine and any
//! front end depend on this crate; it has no async or I/O dependencies.

pub mod session;
pub mod wire;

pub use session::{HistoryItem, MediaMeta, SessionLimits, SessionSnapshot};
pub use wire::{ClientMessage, ServerEvent};
