//! Statement classification
//!
//! Turns a client packet into the routing-relevant facts about it: what
//! kind of statement it is, which tables it names, what the reply will look
//! like and which routing hints its comments carry.

mod hint;
mod lexer;
mod sql;

use std::fmt;

pub use hint::RouteHint;
pub use sql::SqlClassifier;

use crate::backend::ReplyShape;
use crate::protocol::{Command, Packet};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("empty statement")]
    Empty,
    #[error("malformed statement: {0}")]
    Malformed(String),
}

/// One routing-relevant property of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QueryType {
    Read = 1,
    Write = 1 << 1,
    /// Changes session state every backend must share
    SessionWrite = 1 << 2,
    UserVarRead = 1 << 3,
    UserVarWrite = 1 << 4,
    /// A read that only the master can answer correctly
    MasterRead = 1 << 5,
    MultiStatement = 1 << 6,
    LoadData = 1 << 7,
    CreateTmpTable = 1 << 8,
    DropTable = 1 << 9,
    BeginTrx = 1 << 10,
    Commit = 1 << 11,
    Rollback = 1 << 12,
    EnableAutocommit = 1 << 13,
    DisableAutocommit = 1 << 14,
}

impl QueryType {
    const ALL: [QueryType; 15] = [
        QueryType::Read,
        QueryType::Write,
        QueryType::SessionWrite,
        QueryType::UserVarRead,
        QueryType::UserVarWrite,
        QueryType::MasterRead,
        QueryType::MultiStatement,
        QueryType::LoadData,
        QueryType::CreateTmpTable,
        QueryType::DropTable,
        QueryType::BeginTrx,
        QueryType::Commit,
        QueryType::Rollback,
        QueryType::EnableAutocommit,
        QueryType::DisableAutocommit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueryType::Read => "READ",
            QueryType::Write => "WRITE",
            QueryType::SessionWrite => "SESSION_WRITE",
            QueryType::UserVarRead => "USERVAR_READ",
            QueryType::UserVarWrite => "USERVAR_WRITE",
            QueryType::MasterRead => "MASTER_READ",
            QueryType::MultiStatement => "MULTI_STMT",
            QueryType::LoadData => "LOAD_DATA",
            QueryType::CreateTmpTable => "CREATE_TMP_TABLE",
            QueryType::DropTable => "DROP_TABLE",
            QueryType::BeginTrx => "BEGIN_TRX",
            QueryType::Commit => "COMMIT",
            QueryType::Rollback => "ROLLBACK",
            QueryType::EnableAutocommit => "ENABLE_AUTOCOMMIT",
            QueryType::DisableAutocommit => "DISABLE_AUTOCOMMIT",
        }
    }
}

/// Set of `QueryType`s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryTypes(u32);

impl QueryTypes {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, ty: QueryType) {
        self.0 |= ty as u32;
    }

    pub fn remove(&mut self, ty: QueryType) {
        self.0 &= !(ty as u32);
    }

    pub fn contains(self, ty: QueryType) -> bool {
        self.0 & ty as u32 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: QueryTypes) -> QueryTypes {
        QueryTypes(self.0 | other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = QueryType> {
        QueryType::ALL.into_iter().filter(move |ty| self.contains(*ty))
    }
}

impl FromIterator<QueryType> for QueryTypes {
    fn from_iter<I: IntoIterator<Item = QueryType>>(iter: I) -> Self {
        let mut types = QueryTypes::empty();
        for ty in iter {
            types.insert(ty);
        }
        types
    }
}

impl fmt::Display for QueryTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for ty in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(ty.as_str())?;
            first = false;
        }
        if first {
            f.write_str("UNKNOWN")?;
        }
        Ok(())
    }
}

/// Everything the router needs to know about one client packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryClassification {
    pub command: Command,
    pub types: QueryTypes,
    /// Referenced tables, lowercased, without database qualifier
    pub tables: Vec<String>,
    pub hints: Vec<RouteHint>,
    pub reply: ReplyShape,
}

impl QueryClassification {
    pub fn new(command: Command, types: QueryTypes) -> Self {
        Self {
            command,
            types,
            tables: Vec::new(),
            hints: Vec::new(),
            reply: ReplyShape::Standard,
        }
    }

    /// Raw payload following a statement (LOCAL INFILE data, packet fragments)
    pub fn raw() -> Self {
        Self {
            reply: ReplyShape::None,
            ..Self::new(Command::Unknown, QueryTypes::empty())
        }
    }

    pub fn is(&self, ty: QueryType) -> bool {
        self.types.contains(ty)
    }

    /// Plain read with no side effects anywhere
    pub fn is_read(&self) -> bool {
        self.is(QueryType::Read)
            && !self.is(QueryType::Write)
            && !self.is(QueryType::SessionWrite)
            && !self.is(QueryType::UserVarWrite)
    }

    pub fn is_trx_control(&self) -> bool {
        self.is(QueryType::BeginTrx) || self.is(QueryType::Commit) || self.is(QueryType::Rollback)
    }
}

/// Classifies client packets for routing
pub trait StatementClassifier: Send + Sync {
    fn classify(&self, packet: &Packet) -> Result<QueryClassification, ClassificationError>;
}
