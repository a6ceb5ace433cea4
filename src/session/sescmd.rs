//! Session command history
//!
//! Statements that change session state are kept in order so a backend that
//! joins later can be brought to the same state by replaying them.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;

use crate::backend::ReplyOutcome;
use crate::config::RouterConfig;
use crate::protocol::Command;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SessionCommandError {
    #[error("session command history limit of {limit} entries reached")]
    HistoryOverflow { limit: usize },
    #[error("session command {needed} is no longer in the history (oldest kept is {oldest})")]
    Evicted { needed: u64, oldest: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommand {
    position: u64,
    command: Command,
    /// Client payload, command byte included
    payload: Bytes,
    /// Outcome of the first reply received
    outcome: Option<ReplyOutcome>,
    /// Every backend attached at the time has replied
    acknowledged: bool,
}

impl SessionCommand {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn outcome(&self) -> Option<&ReplyOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }
}

impl fmt::Display for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.position, self.command.name())?;
        if self.command == Command::Query {
            let sql = String::from_utf8_lossy(self.payload.get(1..).unwrap_or_default());
            let preview: String = sql.chars().take(64).collect();
            write!(f, " {}", preview)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionCommandLog {
    entries: VecDeque<SessionCommand>,
    next_position: u64,
    /// Positions below this are gone from `entries`
    oldest_retained: u64,
    /// 0 means unlimited
    max_entries: usize,
    prune: bool,
    disabled: bool,
}

impl SessionCommandLog {
    pub fn new(max_entries: usize, prune: bool, disabled: bool) -> Self {
        Self {
            entries: VecDeque::new(),
            next_position: 0,
            oldest_retained: 0,
            max_entries,
            prune,
            disabled,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(
            config.max_sescmd_history,
            config.prune_sescmd_history,
            config.disable_sescmd_history,
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position the next appended command will get
    pub fn end(&self) -> u64 {
        self.next_position
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn get(&self, position: u64) -> Option<&SessionCommand> {
        let index = position.checked_sub(self.oldest_retained)?;
        self.entries.get(usize::try_from(index).ok()?)
    }

    fn get_mut(&mut self, position: u64) -> Option<&mut SessionCommand> {
        let index = position.checked_sub(self.oldest_retained)?;
        self.entries.get_mut(usize::try_from(index).ok()?)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionCommand> {
        self.entries.iter()
    }

    /// Record a new command and return its position. A full history either
    /// evicts its oldest entry or rejects the command, leaving the log as it
    /// was.
    pub fn append(&mut self, command: Command, payload: Bytes) -> Result<u64, SessionCommandError> {
        let position = self.next_position;
        if self.disabled {
            self.next_position += 1;
            self.oldest_retained = self.next_position;
            return Ok(position);
        }

        if self.max_entries > 0 && self.entries.len() >= self.max_entries {
            if !self.prune {
                return Err(SessionCommandError::HistoryOverflow {
                    limit: self.max_entries,
                });
            }
            self.entries.pop_front();
            self.oldest_retained += 1;
        }

        self.entries.push_back(SessionCommand {
            position,
            command,
            payload,
            outcome: None,
            acknowledged: false,
        });
        self.next_position += 1;
        Ok(position)
    }

    /// Keep the first outcome seen for `position`; returns it
    pub fn record_outcome(&mut self, position: u64, outcome: &ReplyOutcome) -> Option<&ReplyOutcome> {
        let entry = self.get_mut(position)?;
        if entry.outcome.is_none() {
            entry.outcome = Some(outcome.clone());
        }
        entry.outcome.as_ref()
    }

    pub fn acknowledge(&mut self, position: u64) {
        if let Some(entry) = self.get_mut(position) {
            entry.acknowledged = true;
        }
    }

    /// Commands a backend that acknowledged everything below `acked` still
    /// needs, in order
    pub fn replay_from(&self, acked: u64) -> Result<Vec<&SessionCommand>, SessionCommandError> {
        if acked < self.oldest_retained {
            return Err(SessionCommandError::Evicted {
                needed: acked,
                oldest: self.oldest_retained,
            });
        }
        Ok(self.entries.iter().filter(|e| e.position >= acked).collect())
    }
}
