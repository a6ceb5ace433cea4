//! Backend connections
//!
//! - `BackendLink`: authenticated TCP link to one server
//! - `BackendConnection`: the session's bookkeeping for one link
//! - `ReplyTracker`: structural progress of the reply in flight

mod connection;
mod link;
mod reply;

pub use connection::{BackendConnection, BackendEvent, BackendId, CompletedReply, ReplyKind};
pub use link::{BackendLink, ConnectionError, LinkSink, LinkStream};
pub use reply::{ReplyOutcome, ReplyShape};
