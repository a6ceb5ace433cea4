use std::collections::HashSet;

use crate::classifier::{QueryClassification, QueryType};

/// Per-session state that outlives single statements
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Client username
    pub username: String,
    /// Client host, without port
    pub host: String,
    /// Current database
    pub database: Option<String>,
    /// Client capability flags
    pub capability_flags: u32,
    /// Explicit BEGIN / START TRANSACTION in effect
    explicit_transaction: bool,
    autocommit: bool,
    /// Every statement goes to the master from now on
    locked_to_master: bool,
    /// Temporary tables created in this session
    temp_tables: HashSet<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            username: String::new(),
            host: String::new(),
            database: None,
            capability_flags: 0,
            explicit_transaction: false,
            autocommit: true,
            locked_to_master: false,
            temp_tables: HashSet::new(),
        }
    }
}

impl SessionState {
    pub fn new(username: String, host: String, database: Option<String>, capabilities: u32) -> Self {
        Self {
            username,
            host,
            database,
            capability_flags: capabilities,
            ..Self::default()
        }
    }

    /// With autocommit off every statement runs inside a transaction
    pub fn in_transaction(&self) -> bool {
        self.explicit_transaction || !self.autocommit
    }

    pub fn locked_to_master(&self) -> bool {
        self.locked_to_master
    }

    pub fn lock_to_master(&mut self) {
        self.locked_to_master = true;
    }

    pub fn temp_tables(&self) -> &HashSet<String> {
        &self.temp_tables
    }

    /// Apply the effects of a statement that completed successfully
    pub fn statement_succeeded(&mut self, classification: &QueryClassification) {
        if classification.is(QueryType::BeginTrx) {
            self.explicit_transaction = true;
        }
        if classification.is(QueryType::Commit) || classification.is(QueryType::Rollback) {
            self.explicit_transaction = false;
        }
        if classification.is(QueryType::DisableAutocommit) {
            self.autocommit = false;
        }
        if classification.is(QueryType::EnableAutocommit) {
            self.autocommit = true;
            self.explicit_transaction = false;
        }
        if classification.is(QueryType::CreateTmpTable) {
            self.temp_tables.extend(classification.tables.iter().cloned());
        } else if classification.is(QueryType::DropTable) {
            for table in &classification.tables {
                self.temp_tables.remove(table);
            }
        }
    }

    /// A transaction-ending statement ends the transaction even when it fails
    pub fn statement_failed(&mut self, classification: &QueryClassification) {
        if classification.is(QueryType::Commit) || classification.is(QueryType::Rollback) {
            self.explicit_transaction = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{SqlClassifier, StatementClassifier};
    use crate::protocol::{Command, Packet};

    fn classify(sql: &str) -> QueryClassification {
        let mut payload = vec![Command::Query as u8];
        payload.extend_from_slice(sql.as_bytes());
        SqlClassifier::new().classify(&Packet::new(0, payload)).unwrap()
    }

    #[test]
    fn test_transaction_lifecycle() {
        let mut state = SessionState::default();
        assert!(!state.in_transaction());
        state.statement_succeeded(&classify("BEGIN"));
        assert!(state.in_transaction());
        state.statement_succeeded(&classify("COMMIT"));
        assert!(!state.in_transaction());

        state.statement_succeeded(&classify("SET autocommit=0"));
        assert!(state.in_transaction());
        state.statement_succeeded(&classify("COMMIT"));
        assert!(state.in_transaction());
        state.statement_succeeded(&classify("SET autocommit=1"));
        assert!(!state.in_transaction());
    }

    #[test]
    fn test_temp_tables() {
        let mut state = SessionState::default();
        state.statement_succeeded(&classify("CREATE TEMPORARY TABLE tmp (id INT)"));
        assert!(state.temp_tables().contains("tmp"));
        state.statement_succeeded(&classify("DROP TABLE tmp"));
        assert!(state.temp_tables().is_empty());
    }
}
