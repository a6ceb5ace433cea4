//! Backend directory and health monitoring
//!
//! - `ServerDirectory`: the configured servers, shared by all sessions
//! - `Server`: role, replication lag, health and load counters of one server
//! - `Monitor`: periodic tasks refreshing role, lag and health

mod monitor;
mod probe;
mod server;
mod state;

pub use monitor::Monitor;
pub use server::{ConnectionSlot, OperationGuard, Server, ServerDirectory};
#[cfg(test)]
pub use state::WindowConfig;
