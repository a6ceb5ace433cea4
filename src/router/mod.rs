//! Read/write split routing
//!
//! - `RouterInstance`: configuration and counters shared by all sessions
//! - `decide`: where one classified statement goes
//! - `select_best` / `rank`: slave selection criteria

mod instance;
mod rw_split;
mod selector;
mod target;

pub use instance::RouterInstance;
pub use rw_split::{decide, Routing, RoutingContext, RoutingError};
pub use selector::Rankable;
pub use target::RouteTarget;
