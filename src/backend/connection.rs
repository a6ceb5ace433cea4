//! Session-side view of one backend link
//!
//! `BackendConnection` holds no socket. The session feeds it the packets read
//! from its link and asks it where each reply belongs; the async driver owns
//! the actual I/O.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ServerRole;
use crate::health::{ConnectionSlot, OperationGuard, Server};
use crate::protocol::Packet;
use crate::router::Rankable;

use super::reply::{Progress, ProtocolViolation, ReplyOutcome, ReplyShape, ReplyTracker};

/// Session-unique backend handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub u64);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who is waiting for a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// The statement the client is waiting on
    Client,
    /// Live broadcast of the session command at this log position
    SessionCommand(u64),
    /// Replay of the session command at this log position
    Replay(u64),
    /// Keepalive COM_PING
    Probe,
}

#[derive(Debug)]
struct PendingReply {
    kind: ReplyKind,
    shape: ReplyShape,
    _operation: OperationGuard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedReply {
    pub kind: ReplyKind,
    pub outcome: ReplyOutcome,
    pub packets: Vec<Packet>,
    /// Server status flags of the terminating OK/EOF
    pub status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Pending,
    /// LOCAL INFILE request, to be passed to the client at once
    LocalInfile(Packet),
    Completed(CompletedReply),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Catching up on the session command history; not routable yet
    Replaying,
    Ready,
    Closed,
}

#[derive(Debug)]
pub struct BackendConnection {
    id: BackendId,
    server: Arc<Server>,
    role: ServerRole,
    state: LinkState,
    /// Disagreed with the other backends on a session command
    degraded: bool,
    tracker: ReplyTracker,
    pending: VecDeque<PendingReply>,
    buffer: Vec<Packet>,
    /// Every history position below this one has been acknowledged
    sescmd_acked: u64,
    last_activity: Instant,
    _slot: ConnectionSlot,
}

impl BackendConnection {
    pub fn new(id: BackendId, server: Arc<Server>, role: ServerRole) -> Self {
        Self {
            id,
            _slot: ConnectionSlot::session(server.clone()),
            server,
            role,
            state: LinkState::Ready,
            degraded: false,
            tracker: ReplyTracker::default(),
            pending: VecDeque::new(),
            buffer: Vec::new(),
            sescmd_acked: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.server.name()
    }

    pub fn server_handle(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Not closed
    pub fn is_usable(&self) -> bool {
        self.state != LinkState::Closed
    }

    /// Usable and caught up with the session command history
    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    pub fn is_replaying(&self) -> bool {
        self.state == LinkState::Replaying
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn set_degraded(&mut self) {
        self.degraded = true;
    }

    /// Replies still expected from the server
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn sescmd_acked(&self) -> u64 {
        self.sescmd_acked
    }

    /// Acknowledge history position `position`. Only the next position in
    /// sequence is accepted so the acknowledged set stays a prefix.
    pub fn acknowledge(&mut self, position: u64) -> bool {
        if position == self.sescmd_acked {
            self.sescmd_acked += 1;
            true
        } else {
            false
        }
    }

    pub fn start_replay(&mut self) {
        self.state = LinkState::Replaying;
    }

    pub fn finish_replay(&mut self) {
        if self.state == LinkState::Replaying {
            self.state = LinkState::Ready;
        }
    }

    /// Idle for longer than the keepalive interval
    pub fn needs_keepalive(&self, interval: Option<Duration>) -> bool {
        match interval {
            Some(interval) => self.pending.is_empty() && self.last_activity.elapsed() > interval,
            None => false,
        }
    }

    /// A command was written to the link; track its reply
    pub fn expect_reply(&mut self, kind: ReplyKind, shape: ReplyShape) {
        self.last_activity = Instant::now();
        if shape == ReplyShape::None {
            return;
        }
        if self.pending.is_empty() {
            self.tracker.start(shape);
        }
        self.pending.push_back(PendingReply {
            kind,
            shape,
            _operation: OperationGuard::new(self.server.clone()),
        });
    }

    /// Kind of the reply the next packet belongs to
    pub fn front_kind(&self) -> Option<ReplyKind> {
        self.pending.front().map(|p| p.kind)
    }

    /// The client's LOCAL INFILE data was forwarded in full
    pub fn local_infile_sent(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn on_packet(&mut self, packet: Packet) -> Result<BackendEvent, ProtocolViolation> {
        if self.pending.is_empty() {
            return Err(ProtocolViolation::Unsolicited);
        }
        self.last_activity = Instant::now();

        match self.tracker.feed(&packet)? {
            Progress::Partial => {
                self.buffer.push(packet);
                Ok(BackendEvent::Pending)
            }
            Progress::LocalInfile => Ok(BackendEvent::LocalInfile(packet)),
            Progress::Complete(outcome) => {
                self.buffer.push(packet);
                let done = self.pending.pop_front().ok_or(ProtocolViolation::Unsolicited)?;
                if let Some(next) = self.pending.front() {
                    self.tracker.start(next.shape);
                }
                Ok(BackendEvent::Completed(CompletedReply {
                    kind: done.kind,
                    outcome,
                    packets: std::mem::take(&mut self.buffer),
                    status: self.tracker.last_status(),
                }))
            }
        }
    }

    /// Stop using the link. Pending replies are abandoned.
    pub fn close(&mut self) {
        self.state = LinkState::Closed;
        self.pending.clear();
        self.buffer.clear();
        self.tracker.reset();
    }

    #[cfg(test)]
    pub fn backdate_activity(&mut self, by: Duration) {
        if let Some(earlier) = self.last_activity.checked_sub(by) {
            self.last_activity = earlier;
        }
    }
}

impl Rankable for BackendConnection {
    fn server(&self) -> &Server {
        &self.server
    }
}
