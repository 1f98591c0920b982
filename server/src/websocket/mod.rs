//! WebSocket support for live viewers.
//!
//! Viewers connect via WebSocket and are pushed every change of the
//! collections they watch, including optimistic ones and rollbacks.

mod manager;
mod protocol;

pub use manager::{spawn_fanout, ConnectionManager};
pub use protocol::*;
