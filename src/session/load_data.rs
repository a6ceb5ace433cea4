//! LOAD DATA LOCAL INFILE streaming state
//!
//! Once the statement is routed, the file contents the client streams must
//! reach the same backend. An empty data packet ends the stream.

use crate::backend::BackendId;
use crate::protocol::MAX_PACKET_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadDataState {
    #[default]
    Inactive,
    /// Statement sent, waiting for the server's file request or the first chunk
    Start,
    /// Data chunks flowing to the locked backend
    Active,
    /// Terminating empty chunk forwarded, final reply pending
    End,
    /// Stream abandoned; client chunks are discarded up to the terminator
    Draining,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LoadDataError {
    #[error("statement not allowed while LOAD DATA LOCAL INFILE is in progress")]
    NotAllowed,
    #[error("LOAD DATA target cannot change from {locked} to {requested}")]
    TargetChanged { locked: BackendId, requested: BackendId },
    #[error("LOAD DATA target backend was lost")]
    TargetLost,
    #[error("data received after the LOAD DATA terminator")]
    MalformedTerminator,
    #[error("no LOAD DATA LOCAL INFILE in progress")]
    NotStarted,
}

#[derive(Debug, Clone, Default)]
pub struct LoadData {
    state: LoadDataState,
    target: Option<BackendId>,
    /// The server asked for the file
    requested: bool,
    /// The last chunk was full-size, so an empty one continues it
    continued: bool,
    bytes: u64,
    /// Sequence id of the last client chunk
    last_sequence: Option<u8>,
    aborted: Option<LoadDataError>,
}

impl LoadData {
    pub fn state(&self) -> LoadDataState {
        self.state
    }

    pub fn target(&self) -> Option<BackendId> {
        self.target
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// The target is locked until the stream is over
    pub fn is_active(&self) -> bool {
        self.state != LoadDataState::Inactive
    }

    /// Client packets are file data rather than statements
    pub fn accepting_data(&self) -> bool {
        match self.state {
            LoadDataState::Start => self.requested,
            LoadDataState::Active | LoadDataState::Draining => true,
            _ => false,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.state == LoadDataState::Draining
    }

    /// Sequence id for a reply that follows the client's last chunk
    pub fn reply_sequence(&self) -> Option<u8> {
        self.last_sequence.map(|seq| seq.wrapping_add(1))
    }

    pub fn start(&mut self, target: BackendId) -> Result<(), LoadDataError> {
        if self.is_active() {
            return Err(LoadDataError::NotAllowed);
        }
        *self = LoadData {
            state: LoadDataState::Start,
            target: Some(target),
            ..LoadData::default()
        };
        Ok(())
    }

    /// The locked backend sent its LOCAL INFILE request
    pub fn server_requested(&mut self, from: BackendId) -> Result<(), LoadDataError> {
        if self.state != LoadDataState::Start {
            return Err(LoadDataError::NotStarted);
        }
        self.ensure_target(from)?;
        self.requested = true;
        Ok(())
    }

    pub fn ensure_target(&self, requested: BackendId) -> Result<(), LoadDataError> {
        match self.target {
            Some(locked) if locked != requested => Err(LoadDataError::TargetChanged { locked, requested }),
            Some(_) => Ok(()),
            None => Err(LoadDataError::NotStarted),
        }
    }

    /// One data packet for `target`; an empty one ends the stream
    pub fn on_chunk(&mut self, target: BackendId, len: usize, sequence: u8) -> Result<LoadDataState, LoadDataError> {
        self.ensure_target(target)?;
        match self.state {
            LoadDataState::Start | LoadDataState::Active => {}
            LoadDataState::End => return Err(LoadDataError::MalformedTerminator),
            LoadDataState::Inactive | LoadDataState::Draining => return Err(LoadDataError::NotStarted),
        }
        self.last_sequence = Some(sequence);
        if self.terminates(len) {
            self.state = LoadDataState::End;
        } else {
            self.state = LoadDataState::Active;
            self.bytes += len as u64;
        }
        Ok(self.state)
    }

    fn terminates(&mut self, len: usize) -> bool {
        let end = len == 0 && !self.continued;
        self.continued = len == MAX_PACKET_SIZE;
        end
    }

    /// Give up on the stream. While the client is still uploading the lock
    /// is released but the remaining chunks must be drained; returns false
    /// when the stream is simply over.
    pub fn abort(&mut self, reason: LoadDataError) -> bool {
        if self.state == LoadDataState::Draining {
            return true;
        }
        if !self.accepting_data() {
            *self = LoadData::default();
            return false;
        }
        self.state = LoadDataState::Draining;
        self.target = None;
        self.aborted = Some(reason);
        true
    }

    /// Discard one client chunk. On the terminator the stream is over and
    /// the reason it was abandoned is returned.
    pub fn drain(&mut self, len: usize, sequence: u8) -> Option<LoadDataError> {
        if self.state != LoadDataState::Draining {
            return None;
        }
        self.last_sequence = Some(sequence);
        if !self.terminates(len) {
            return None;
        }
        let reason = self.aborted.take().unwrap_or(LoadDataError::TargetLost);
        *self = LoadData::default();
        Some(reason)
    }

    /// Final reply received; releases the target and returns the bytes sent
    pub fn finish(&mut self) -> u64 {
        let bytes = self.bytes;
        *self = LoadData::default();
        bytes
    }
}
