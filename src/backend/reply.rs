//! Reply tracking for one backend connection
//!
//! The tracker follows the structure of a response without interpreting row
//! data: it only looks at the leading marker byte of each packet and at the
//! status flags of terminating OK/EOF packets.

use crate::protocol::response::{
    is_eof_packet, is_err_packet, is_local_infile_request, is_ok_packet, more_results_exist,
    status_flags, PrepareOk,
};
use crate::protocol::wire::read_lenenc_int;
use crate::protocol::{ErrPacket, Packet};

/// Progress of the response to the statement in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// Statement sent, nothing received yet (or the next result of a
    /// multi-result reply is due)
    AwaitingFirst,
    /// Column count or prepare header received, definitions pending
    ResultsetHeader,
    /// Definitions done, rows until the terminating EOF
    ResultsetRows,
    Complete,
}

impl ReplyState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplyState::AwaitingFirst => "awaiting_first",
            ReplyState::ResultsetHeader => "resultset_header",
            ReplyState::ResultsetRows => "resultset_rows",
            ReplyState::Complete => "complete",
        }
    }
}

/// Structure of the response a command produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyShape {
    /// OK, ERR, LOCAL INFILE request or a result set (possibly several)
    #[default]
    Standard,
    /// COM_FIELD_LIST: column definitions terminated by EOF
    FieldList,
    /// COM_STMT_PREPARE: prepare OK followed by parameter and column blocks
    Prepare,
    /// COM_STMT_FETCH: rows terminated by EOF
    Fetch,
    /// COM_STATISTICS: a single string packet
    Single,
    /// The server sends nothing back
    None,
}

/// Terminal outcome of a reply, compared across backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Ok,
    ResultSet,
    Err { code: u16, message: String },
}

impl ReplyOutcome {
    pub fn is_err(&self) -> bool {
        matches!(self, ReplyOutcome::Err { .. })
    }

    /// Two replies agree when both succeeded or both failed with the same code
    pub fn matches(&self, other: &ReplyOutcome) -> bool {
        match (self, other) {
            (ReplyOutcome::Err { code: a, .. }, ReplyOutcome::Err { code: b, .. }) => a == b,
            (ReplyOutcome::Err { .. }, _) | (_, ReplyOutcome::Err { .. }) => false,
            _ => true,
        }
    }

    fn from_err(payload: &[u8]) -> Self {
        match ErrPacket::parse(payload) {
            Some(err) => ReplyOutcome::Err {
                code: err.error_code,
                message: err.error_message,
            },
            None => ReplyOutcome::Err {
                code: 0,
                message: String::new(),
            },
        }
    }
}

impl std::fmt::Display for ReplyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyOutcome::Ok => write!(f, "OK"),
            ReplyOutcome::ResultSet => write!(f, "result set"),
            ReplyOutcome::Err { code, message } => write!(f, "error {}: {}", code, message),
        }
    }
}

/// What one packet did to the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Partial,
    /// The server asked for the contents of a local file
    LocalInfile,
    Complete(ReplyOutcome),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("packet received with no statement in flight")]
    Unsolicited,
    #[error("unexpected packet 0x{header:02x} in state {state}")]
    Unexpected { state: &'static str, header: u8 },
    #[error("malformed {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone)]
pub struct ReplyTracker {
    state: ReplyState,
    shape: ReplyShape,
    /// Definition packets still expected in `ResultsetHeader`; `None` when
    /// only the terminating EOF ends the block
    pending_definitions: Option<u64>,
    /// Definition blocks of a prepare reply not yet started
    prepare_blocks: Vec<u64>,
    /// The previous packet was full-size; the next one continues its payload
    continuation: bool,
    saw_resultset: bool,
    last_status: Option<u16>,
}

impl Default for ReplyTracker {
    fn default() -> Self {
        Self {
            state: ReplyState::Complete,
            shape: ReplyShape::Standard,
            pending_definitions: None,
            prepare_blocks: Vec::new(),
            continuation: false,
            saw_resultset: false,
            last_status: None,
        }
    }
}

impl ReplyTracker {
    pub fn state(&self) -> ReplyState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ReplyState::Complete
    }

    /// Server status flags from the last OK or EOF seen
    pub fn last_status(&self) -> Option<u16> {
        self.last_status
    }

    /// Arm the tracker for a freshly sent command
    pub fn start(&mut self, shape: ReplyShape) {
        self.shape = shape;
        self.pending_definitions = None;
        self.prepare_blocks.clear();
        self.continuation = false;
        self.saw_resultset = false;
        self.state = match shape {
            ReplyShape::Standard | ReplyShape::Prepare | ReplyShape::Single => ReplyState::AwaitingFirst,
            ReplyShape::FieldList => ReplyState::ResultsetHeader,
            ReplyShape::Fetch => ReplyState::ResultsetRows,
            ReplyShape::None => ReplyState::Complete,
        };
    }

    /// Drop whatever was in flight
    pub fn reset(&mut self) {
        self.state = ReplyState::Complete;
        self.continuation = false;
    }

    pub fn feed(&mut self, packet: &Packet) -> Result<Progress, ProtocolViolation> {
        let payload = &packet.payload[..];
        let continued = std::mem::replace(&mut self.continuation, packet.is_continued());
        if continued {
            return Ok(Progress::Partial);
        }

        let header = payload.first().copied().unwrap_or(0);
        let state = self.state;
        let unexpected = ProtocolViolation::Unexpected {
            state: state.as_str(),
            header,
        };

        match state {
            ReplyState::Complete => Err(ProtocolViolation::Unsolicited),
            _ if is_err_packet(payload) => Ok(self.finish(ReplyOutcome::from_err(payload))),
            ReplyState::AwaitingFirst => {
                match self.shape {
                    ReplyShape::Prepare => return self.on_prepare_ok(payload),
                    ReplyShape::Single => return Ok(self.finish(ReplyOutcome::Ok)),
                    _ => {}
                }
                // COM_SET_OPTION answers with a bare EOF
                if is_ok_packet(payload) || is_eof_packet(payload) {
                    return Ok(self.end_of_result(payload));
                }
                if is_local_infile_request(payload) {
                    return Ok(Progress::LocalInfile);
                }
                match read_lenenc_int(payload) {
                    Some((count, _)) if count > 0 => {
                        self.saw_resultset = true;
                        self.pending_definitions = Some(count);
                        self.state = ReplyState::ResultsetHeader;
                        Ok(Progress::Partial)
                    }
                    _ => Err(unexpected),
                }
            }
            ReplyState::ResultsetHeader => match self.pending_definitions {
                Some(0) | None if is_eof_packet(payload) => Ok(self.definitions_done()),
                Some(0) => Err(unexpected),
                Some(n) => {
                    self.pending_definitions = Some(n - 1);
                    Ok(Progress::Partial)
                }
                None => Ok(Progress::Partial),
            },
            ReplyState::ResultsetRows => {
                if is_eof_packet(payload) {
                    self.saw_resultset = true;
                    return Ok(self.end_of_result(payload));
                }
                Ok(Progress::Partial)
            }
        }
    }

    fn on_prepare_ok(&mut self, payload: &[u8]) -> Result<Progress, ProtocolViolation> {
        let prepare = PrepareOk::parse(payload).ok_or(ProtocolViolation::Malformed("prepare OK"))?;
        self.prepare_blocks = [prepare.params, prepare.columns]
            .into_iter()
            .filter(|&n| n > 0)
            .map(u64::from)
            .rev()
            .collect();
        Ok(self.next_prepare_block())
    }

    fn next_prepare_block(&mut self) -> Progress {
        match self.prepare_blocks.pop() {
            Some(count) => {
                self.pending_definitions = Some(count);
                self.state = ReplyState::ResultsetHeader;
                Progress::Partial
            }
            None => self.finish(ReplyOutcome::Ok),
        }
    }

    fn definitions_done(&mut self) -> Progress {
        match self.shape {
            ReplyShape::Standard => {
                self.state = ReplyState::ResultsetRows;
                Progress::Partial
            }
            ReplyShape::Prepare => self.next_prepare_block(),
            _ => self.finish(ReplyOutcome::ResultSet),
        }
    }

    /// OK or EOF closing one result; more may follow in the same reply
    fn end_of_result(&mut self, payload: &[u8]) -> Progress {
        self.last_status = status_flags(payload).or(self.last_status);
        if more_results_exist(payload) {
            self.pending_definitions = None;
            self.state = ReplyState::AwaitingFirst;
            return Progress::Partial;
        }
        let outcome = if self.saw_resultset {
            ReplyOutcome::ResultSet
        } else {
            ReplyOutcome::Ok
        };
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: ReplyOutcome) -> Progress {
        self.state = ReplyState::Complete;
        Progress::Complete(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::response::{EOF_HEADER, OK_HEADER};
    use crate::protocol::packet::status::SERVER_MORE_RESULTS_EXISTS;
    use crate::protocol::MAX_PACKET_SIZE;

    fn pkt(payload: &[u8]) -> Packet {
        Packet::new(1, payload.to_vec())
    }

    fn eof(status: u16) -> Packet {
        let flags = status.to_le_bytes();
        pkt(&[EOF_HEADER, 0, 0, flags[0], flags[1]])
    }

    fn ok(status: u16) -> Packet {
        let flags = status.to_le_bytes();
        pkt(&[OK_HEADER, 0, 0, flags[0], flags[1], 0, 0])
    }

    fn column() -> Packet {
        pkt(b"\x03def\x00\x00\x00\x01a\x01a")
    }

    fn err() -> Packet {
        ErrPacket::new(1146, "42S02", "no such table")
            .encode(1, crate::protocol::capabilities::CLIENT_PROTOCOL_41)
    }

    #[test]
    fn test_statistics_string_is_one_packet() {
        let mut tracker = ReplyTracker::default();
        tracker.start(ReplyShape::Single);
        let progress = tracker.feed(&pkt(b"Uptime: 42  Threads: 1")).unwrap();
        assert_eq!(progress, Progress::Complete(ReplyOutcome::Ok));
        assert!(tracker.is_complete());
    }

    #[test]
    fn test_ok_completes_immediately() {
        let mut tracker = ReplyTracker::default();
        tracker.start(ReplyShape::Standard);
        assert_eq!(tracker.state(), ReplyState::AwaitingFirst);
        assert_eq!(tracker.feed(&ok(0x0002)).unwrap(), Progress::Complete(ReplyOutcome::Ok));
        assert!(tracker.is_complete());
        assert_eq!(tracker.last_status(), Some(0x0002));

        tracker.start(ReplyShape::Standard);
        assert_eq!(tracker.feed(&eof(0x0002)).unwrap(), Progress::Complete(ReplyOutcome::Ok));
    }

    #[test]
    fn test_resultset_walks_all_states() {
        let mut tracker = ReplyTracker::default();
        tracker.start(ReplyShape::Standard);

        assert_eq!(tracker.feed(&pkt(&[2])).unwrap(), Progress::Partial);
        assert_eq!(tracker.state(), ReplyState::ResultsetHeader);
        tracker.feed(&column()).unwrap();
        tracker.feed(&column()).unwrap();
        assert_eq!(tracker.state(), ReplyState::ResultsetHeader);
        tracker.feed(&eof(0)).unwrap();
        assert_eq!(tracker.state(), ReplyState::ResultsetRows);

        // A row starting with 0x00 is not an OK packet here
        tracker.feed(&pkt(&[0x00, 0x01])).unwrap();
        tracker.feed(&pkt(b"\x01a\x01b")).unwrap();
        assert_eq!(tracker.state(), ReplyState::ResultsetRows);
        assert_eq!(tracker.feed(&eof(0)).unwrap(), Progress::Complete(ReplyOutcome::ResultSet));
    }

    #[test]
    fn test_error_outcome() {
        let mut tracker = ReplyTracker::default();
        tracker.start(ReplyShape::Standard);
        match tracker.feed(&err()).unwrap() {
            Progress::Complete(ReplyOutcome::Err { code, .. }) => assert_eq!(code, 1146),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_multi_result_returns_to_awaiting_first() {
        let mut tracker = ReplyTracker::default();
        tracker.start(ReplyShape::Standard);
        assert_eq!(tracker.feed(&ok(SERVER_MORE_RESULTS_EXISTS)).unwrap(), Progress::Partial);
        assert_eq!(tracker.state(), ReplyState::AwaitingFirst);

        tracker.feed(&pkt(&[1])).unwrap();
        tracker.feed(&column()).unwrap();
        tracker.feed(&eof(0)).unwrap();
        assert_eq!(tracker.feed(&eof(SERVER_MORE_RESULTS_EXISTS)).unwrap(), Progress::Partial);
        assert_eq!(tracker.state(), ReplyState::AwaitingFirst);
        assert_eq!(tracker.feed(&ok(0)).unwrap(), Progress::Complete(ReplyOutcome::ResultSet));
    }

    #[test]
    fn test_local_infile_then_ok() {
        let mut tracker = ReplyTracker::default();
        tracker.start(ReplyShape::Standard);
        assert_eq!(tracker.feed(&pkt(b"\xfb/tmp/data.csv")).unwrap(), Progress::LocalInfile);
        assert_eq!(tracker.state(), ReplyState::AwaitingFirst);
        assert_eq!(tracker.feed(&ok(0)).unwrap(), Progress::Complete(ReplyOutcome::Ok));
    }

    #[test]
    fn test_prepare_reply() {
        let mut tracker = ReplyTracker::default();
        tracker.start(ReplyShape::Prepare);
        // statement 1, 1 column, 2 params
        assert_eq!(tracker.feed(&pkt(&[0, 1, 0, 0, 0, 1, 0, 2, 0, 0, 0, 0])).unwrap(), Progress::Partial);
        tracker.feed(&column()).unwrap();
        tracker.feed(&column()).unwrap();
        assert_eq!(tracker.feed(&eof(0)).unwrap(), Progress::Partial);
        tracker.feed(&column()).unwrap();
        assert_eq!(tracker.feed(&eof(0)).unwrap(), Progress::Complete(ReplyOutcome::Ok));
    }

    #[test]
    fn test_prepare_without_params_or_columns() {
        let mut tracker = ReplyTracker::default();
        tracker.start(ReplyShape::Prepare);
        let progress = tracker.feed(&pkt(&[0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])).unwrap();
        assert_eq!(progress, Progress::Complete(ReplyOutcome::Ok));
    }

    #[test]
    fn test_field_list_and_fetch() {
        let mut tracker = ReplyTracker::default();
        tracker.start(ReplyShape::FieldList);
        tracker.feed(&column()).unwrap();
        assert_eq!(tracker.feed(&eof(0)).unwrap(), Progress::Complete(ReplyOutcome::ResultSet));

        tracker.start(ReplyShape::Fetch);
        tracker.feed(&pkt(&[0x00, 0x00, 0x01])).unwrap();
        assert_eq!(tracker.feed(&eof(0)).unwrap(), Progress::Complete(ReplyOutcome::ResultSet));
    }

    #[test]
    fn test_continuation_is_not_inspected() {
        let mut tracker = ReplyTracker::default();
        tracker.start(ReplyShape::Standard);
        tracker.feed(&pkt(&[1])).unwrap();
        tracker.feed(&column()).unwrap();
        tracker.feed(&eof(0)).unwrap();

        let mut big = vec![0x01; MAX_PACKET_SIZE];
        big[0] = 0xFC;
        tracker.feed(&pkt(&big)).unwrap();
        // Looks like EOF but continues the previous row
        assert_eq!(tracker.feed(&eof(0)).unwrap(), Progress::Partial);
        assert_eq!(tracker.feed(&eof(0)).unwrap(), Progress::Complete(ReplyOutcome::ResultSet));
    }

    #[test]
    fn test_unsolicited_and_garbage() {
        let mut tracker = ReplyTracker::default();
        assert_eq!(tracker.feed(&ok(0)), Err(ProtocolViolation::Unsolicited));

        tracker.start(ReplyShape::Standard);
        assert!(tracker.feed(&pkt(&[])).is_err());

        tracker.start(ReplyShape::None);
        assert!(tracker.is_complete());
    }

    #[test]
    fn test_outcome_matching() {
        let e = |code| ReplyOutcome::Err { code, message: String::new() };
        assert!(ReplyOutcome::Ok.matches(&ReplyOutcome::ResultSet));
        assert!(e(1064).matches(&e(1064)));
        assert!(!e(1064).matches(&e(1146)));
        assert!(!ReplyOutcome::Ok.matches(&e(1064)));
    }
}
