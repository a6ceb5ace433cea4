//! Routing decision for one classified statement
//!
//! `route_targets` works out where a statement may go from its
//! classification and the session state; `decide` resolves that to concrete
//! backends of the session.

use std::collections::HashSet;

use tracing::debug;

use crate::backend::{BackendConnection, BackendId};
use crate::classifier::{QueryClassification, QueryType, RouteHint};
use crate::config::{RouterConfig, SqlVariablesIn};
use crate::session::LoadDataError;

use super::selector::select_best;
use super::target::{RouteTarget, RouteTargets};

/// Session state the decision depends on
#[derive(Debug)]
pub struct RoutingContext<'a> {
    pub config: &'a RouterConfig,
    /// Attached backends in attach order
    pub backends: &'a [BackendConnection],
    pub master: Option<BackendId>,
    /// Pinned backend while a LOAD DATA stream or a split packet is in flight
    pub locked_target: Option<BackendId>,
    /// The packet continues the stream the target is locked for
    pub stream_chunk: bool,
    pub in_transaction: bool,
    /// Set after a multi-statement batch under strict_multi_stmt
    pub locked_to_master: bool,
    pub temp_tables: &'a HashSet<String>,
    /// Backends already tried for this statement
    pub excluded: &'a [BackendId],
}

impl RoutingContext<'_> {
    fn backend(&self, id: BackendId) -> Option<&BackendConnection> {
        self.backends.iter().find(|b| b.id() == id)
    }

    fn usable_master(&self) -> Option<BackendId> {
        self.master
            .and_then(|id| self.backend(id))
            .filter(|b| b.is_ready())
            .map(|b| b.id())
    }

    fn lag_eligible(&self, backend: &BackendConnection, max_lag: Option<u64>) -> bool {
        match max_lag {
            None => true,
            Some(max) => backend
                .server_handle()
                .replication_lag()
                .map_or(false, |lag| lag <= max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    Single { backend: BackendId, target: RouteTarget },
    /// Session command for every listed backend
    Broadcast(Vec<BackendId>),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no eligible backend for {0}")]
    NoEligibleBackend(RouteTargets),
    #[error("master is not available")]
    MasterUnavailable,
    #[error(
        "SELECT with session data modification is not supported if configuration parameter \
         use_sql_variables_in=all"
    )]
    SelectModifiesSessionData,
    #[error(transparent)]
    LoadData(#[from] LoadDataError),
}

impl RoutingError {
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingError::NoEligibleBackend(_) => "no_backend",
            RoutingError::MasterUnavailable => "master_unavailable",
            RoutingError::SelectModifiesSessionData => "session_data_select",
            RoutingError::LoadData(_) => "load_data",
        }
    }
}

fn touches_user_variables(classification: &QueryClassification) -> bool {
    classification.is(QueryType::UserVarRead) || classification.is(QueryType::UserVarWrite)
}

/// Broadcast statements: session state every backend must share
pub fn is_session_command(classification: &QueryClassification, config: &RouterConfig) -> bool {
    if classification.is(QueryType::Read) {
        return false;
    }
    let user_vars = classification.is(QueryType::UserVarWrite);
    let shared = classification.is(QueryType::SessionWrite) || user_vars;
    shared && !(user_vars && config.use_sql_variables_in == SqlVariablesIn::Master)
}

/// Where the statement may go, before looking at concrete backends
pub fn route_targets(classification: &QueryClassification, ctx: &RoutingContext<'_>) -> RouteTargets {
    let config = ctx.config;

    if is_session_command(classification, config) {
        return RouteTarget::All.into();
    }

    let references_temp_table = classification
        .tables
        .iter()
        .any(|t| ctx.temp_tables.contains(t));
    let master_only = references_temp_table
        || ctx.in_transaction
        || ctx.locked_to_master
        || classification.is(QueryType::Write)
        || classification.is(QueryType::SessionWrite)
        || classification.is(QueryType::UserVarWrite)
        || classification.is(QueryType::MasterRead)
        || classification.is_trx_control()
        || (classification.is(QueryType::MultiStatement) && config.strict_multi_stmt)
        || (touches_user_variables(classification)
            && config.use_sql_variables_in == SqlVariablesIn::Master);
    if master_only || !classification.is_read() {
        return RouteTarget::Master.into();
    }

    let mut targets = RouteTargets::empty();
    for hint in &classification.hints {
        targets = match hint {
            RouteHint::ToMaster => targets.with(RouteTarget::Master),
            RouteHint::ToSlave => targets.with(RouteTarget::Slave),
            RouteHint::ToServer(_) => targets.with(RouteTarget::NamedServer),
            RouteHint::MaxReplicationLag(_) => targets.with(RouteTarget::RlagMax),
        };
    }
    if targets.contains(RouteTarget::Master) {
        return RouteTarget::Master.into();
    }
    targets.with(RouteTarget::Slave)
}

pub fn decide(
    classification: &QueryClassification,
    ctx: &RoutingContext<'_>,
) -> Result<Routing, RoutingError> {
    let config = ctx.config;

    // A locked stream accepts nothing but its own continuation
    if let Some(locked) = ctx.locked_target {
        if !ctx.stream_chunk {
            return Err(LoadDataError::NotAllowed.into());
        }
        return match ctx.backend(locked).filter(|b| b.is_usable()) {
            Some(b) if Some(b.id()) == ctx.master => Ok(Routing::Single {
                backend: b.id(),
                target: RouteTarget::Master,
            }),
            Some(b) => Ok(Routing::Single {
                backend: b.id(),
                target: RouteTarget::Slave,
            }),
            None => Err(LoadDataError::TargetLost.into()),
        };
    }

    if config.use_sql_variables_in == SqlVariablesIn::All
        && classification.is(QueryType::Read)
        && classification.is(QueryType::UserVarWrite)
    {
        return Err(RoutingError::SelectModifiesSessionData);
    }

    let targets = route_targets(classification, ctx);
    debug!(targets = %targets, types = %classification.types, "Route targets");

    if targets.contains(RouteTarget::All) {
        let backends: Vec<BackendId> = ctx
            .backends
            .iter()
            .filter(|b| b.is_usable())
            .map(|b| b.id())
            .collect();
        if !ctx.backends.iter().any(|b| b.is_ready()) {
            return Err(RoutingError::NoEligibleBackend(targets));
        }
        return Ok(Routing::Broadcast(backends));
    }

    if targets.contains(RouteTarget::Master) {
        return match ctx.usable_master() {
            Some(backend) => Ok(Routing::Single {
                backend,
                target: RouteTarget::Master,
            }),
            // Only writes are subject to the master failure mode
            None if classification.is(QueryType::Write)
                || classification.is_trx_control()
                || ctx.in_transaction =>
            {
                Err(RoutingError::MasterUnavailable)
            }
            None => Err(RoutingError::NoEligibleBackend(targets)),
        };
    }

    if targets.contains(RouteTarget::NamedServer) {
        let named = classification.hints.iter().find_map(|h| match h {
            RouteHint::ToServer(name) => Some(name.as_str()),
            _ => None,
        });
        let found = ctx.backends.iter().find(|b| {
            b.is_ready() && !ctx.excluded.contains(&b.id()) && Some(b.name()) == named
        });
        if let Some(b) = found {
            return Ok(Routing::Single {
                backend: b.id(),
                target: RouteTarget::NamedServer,
            });
        }
        debug!(server = ?named, "Hinted server not attached, selecting a slave");
    }

    let max_lag = classification
        .hints
        .iter()
        .find_map(|h| match h {
            RouteHint::MaxReplicationLag(lag) => Some(*lag),
            _ => None,
        })
        .or(config.max_slave_replication_lag);

    if let Some(backend) = select_slave(ctx, max_lag) {
        let target = if targets.contains(RouteTarget::RlagMax) {
            RouteTarget::RlagMax
        } else {
            RouteTarget::Slave
        };
        return Ok(Routing::Single { backend, target });
    }

    match ctx.usable_master() {
        Some(backend) if config.master_accept_reads && !ctx.excluded.contains(&backend) => {
            Ok(Routing::Single {
                backend,
                target: RouteTarget::Master,
            })
        }
        _ => Err(RoutingError::NoEligibleBackend(targets)),
    }
}

/// Best slave by the configured criterion; degraded slaves only when no
/// other one qualifies
fn select_slave(ctx: &RoutingContext<'_>, max_lag: Option<u64>) -> Option<BackendId> {
    let eligible: Vec<&BackendConnection> = ctx
        .backends
        .iter()
        .filter(|b| {
            Some(b.id()) != ctx.master
                && b.is_ready()
                && !ctx.excluded.contains(&b.id())
                && ctx.lag_eligible(b, max_lag)
        })
        .collect();

    let criteria = ctx.config.slave_selection_criteria;
    let healthy: Vec<&BackendConnection> = eligible.iter().copied().filter(|b| !b.is_degraded()).collect();
    let pool = if healthy.is_empty() { eligible } else { healthy };
    select_best(criteria, &pool).map(|index| pool[index].id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::backend::{ReplyKind, ReplyShape};
    use crate::classifier::{QueryTypes, SqlClassifier, StatementClassifier};
    use crate::config::{SelectCriteria, ServerEntry, ServerRole};
    use crate::health::{Server, WindowConfig};
    use crate::protocol::{Command, Packet};

    struct Fixture {
        config: RouterConfig,
        backends: Vec<BackendConnection>,
        temp_tables: HashSet<String>,
        in_transaction: bool,
        locked_to_master: bool,
        locked_target: Option<BackendId>,
        stream_chunk: bool,
        excluded: Vec<BackendId>,
    }

    impl Fixture {
        /// backend 0 is the master, the rest slaves
        fn new(slaves: usize) -> Self {
            let mut backends = vec![backend(0, ServerRole::Master)];
            for i in 1..=slaves {
                backends.push(backend(i as u64, ServerRole::Slave));
            }
            Self {
                config: RouterConfig::default(),
                backends,
                temp_tables: HashSet::new(),
                in_transaction: false,
                locked_to_master: false,
                locked_target: None,
                stream_chunk: false,
                excluded: Vec::new(),
            }
        }

        fn decide(&self, classification: &QueryClassification) -> Result<Routing, RoutingError> {
            let master = self
                .backends
                .iter()
                .find(|b| b.role() == ServerRole::Master)
                .map(|b| b.id());
            let ctx = RoutingContext {
                config: &self.config,
                backends: &self.backends,
                master,
                locked_target: self.locked_target,
                stream_chunk: self.stream_chunk,
                in_transaction: self.in_transaction,
                locked_to_master: self.locked_to_master,
                temp_tables: &self.temp_tables,
                excluded: &self.excluded,
            };
            decide(classification, &ctx)
        }

        fn sql(&self, sql: &str) -> Result<Routing, RoutingError> {
            self.decide(&classify(sql))
        }
    }

    fn backend(id: u64, role: ServerRole) -> BackendConnection {
        let entry = ServerEntry {
            name: format!("db{}", id),
            host: "127.0.0.1".into(),
            port: 3306,
            role,
        };
        let server = Arc::new(Server::new(&entry, WindowConfig::default()));
        BackendConnection::new(BackendId(id), server, role)
    }

    fn classify(sql: &str) -> QueryClassification {
        let mut payload = vec![Command::Query as u8];
        payload.extend_from_slice(sql.as_bytes());
        SqlClassifier::new().classify(&Packet::new(0, payload)).unwrap()
    }

    fn single(id: u64, target: RouteTarget) -> Result<Routing, RoutingError> {
        Ok(Routing::Single {
            backend: BackendId(id),
            target,
        })
    }

    #[test]
    fn test_reads_to_slave_writes_to_master() {
        let f = Fixture::new(2);
        assert_eq!(f.sql("SELECT * FROM t"), single(1, RouteTarget::Slave));
        assert_eq!(f.sql("INSERT INTO t VALUES (1)"), single(0, RouteTarget::Master));
        assert_eq!(f.sql("SELECT LAST_INSERT_ID()"), single(0, RouteTarget::Master));
        assert_eq!(f.sql("BEGIN"), single(0, RouteTarget::Master));
    }

    #[test]
    fn test_session_commands_broadcast() {
        let mut f = Fixture::new(2);
        f.backends[2].start_replay();
        assert_eq!(
            f.sql("SET @a = 1"),
            Ok(Routing::Broadcast(vec![BackendId(0), BackendId(1), BackendId(2)]))
        );
        assert_eq!(
            f.sql("USE shop"),
            Ok(Routing::Broadcast(vec![BackendId(0), BackendId(1), BackendId(2)]))
        );
    }

    #[test]
    fn test_user_variables_on_master_policy() {
        let mut f = Fixture::new(1);
        f.config.use_sql_variables_in = SqlVariablesIn::Master;
        assert_eq!(f.sql("SET @a = 1"), single(0, RouteTarget::Master));
        assert_eq!(f.sql("SELECT @a"), single(0, RouteTarget::Master));
        // Not a user variable: still shared by everyone
        assert!(matches!(f.sql("SET NAMES utf8"), Ok(Routing::Broadcast(_))));

        f.backends[0].close();
        assert!(matches!(f.sql("SET @a = 1"), Err(RoutingError::NoEligibleBackend(_))));
        assert_eq!(f.sql("INSERT INTO t VALUES (1)"), Err(RoutingError::MasterUnavailable));
    }

    #[test]
    fn test_select_modifying_session_data_rejected() {
        let f = Fixture::new(1);
        assert_eq!(
            f.sql("SELECT @a := 1"),
            Err(RoutingError::SelectModifiesSessionData)
        );
        let mut f = Fixture::new(1);
        f.config.use_sql_variables_in = SqlVariablesIn::Master;
        assert_eq!(f.sql("SELECT @a := 1"), single(0, RouteTarget::Master));
    }

    #[test]
    fn test_temp_tables_and_transactions_go_to_master() {
        let mut f = Fixture::new(1);
        f.temp_tables.insert("tmp".into());
        assert_eq!(f.sql("SELECT * FROM tmp"), single(0, RouteTarget::Master));
        assert_eq!(f.sql("SELECT * FROM other"), single(1, RouteTarget::Slave));

        f.in_transaction = true;
        assert_eq!(f.sql("SELECT * FROM other"), single(0, RouteTarget::Master));
    }

    #[test]
    fn test_multi_statements() {
        let mut f = Fixture::new(1);
        assert_eq!(f.sql("SELECT 1; SELECT 2"), single(0, RouteTarget::Master));
        f.config.strict_multi_stmt = false;
        assert_eq!(f.sql("SELECT 1; SELECT 2"), single(1, RouteTarget::Slave));
        f.locked_to_master = true;
        assert_eq!(f.sql("SELECT 1"), single(0, RouteTarget::Master));
    }

    #[test]
    fn test_selection_criteria_and_ties() {
        let mut f = Fixture::new(3);
        f.backends[1].expect_reply(ReplyKind::Client, ReplyShape::Standard);
        f.backends[3].expect_reply(ReplyKind::Client, ReplyShape::Standard);
        assert_eq!(f.sql("SELECT 1"), single(2, RouteTarget::Slave));

        f.config.slave_selection_criteria = SelectCriteria::LeastBehindMaster;
        f.backends[1].server_handle().set_replication_lag(Some(9));
        f.backends[2].server_handle().set_replication_lag(Some(3));
        f.backends[3].server_handle().set_replication_lag(Some(3));
        assert_eq!(f.sql("SELECT 1"), single(2, RouteTarget::Slave));
    }

    #[test]
    fn test_replication_lag_limit() {
        let mut f = Fixture::new(2);
        f.config.max_slave_replication_lag = Some(5);
        f.backends[1].server_handle().set_replication_lag(Some(10));
        f.backends[2].server_handle().set_replication_lag(Some(5));
        assert_eq!(f.sql("SELECT 1"), single(2, RouteTarget::Slave));

        f.backends[2].server_handle().set_replication_lag(None);
        assert_eq!(
            f.sql("SELECT 1"),
            Err(RoutingError::NoEligibleBackend(RouteTarget::Slave.into()))
        );

        f.config.master_accept_reads = true;
        assert_eq!(f.sql("SELECT 1"), single(0, RouteTarget::Master));

        assert_eq!(
            f.sql("SELECT 1 -- maxscale max_slave_replication_lag=20"),
            single(1, RouteTarget::RlagMax)
        );
    }

    #[test]
    fn test_degraded_and_replaying_slaves() {
        let mut f = Fixture::new(2);
        f.backends[1].set_degraded();
        assert_eq!(f.sql("SELECT 1"), single(2, RouteTarget::Slave));
        f.backends[2].start_replay();
        assert_eq!(f.sql("SELECT 1"), single(1, RouteTarget::Slave));
    }

    #[test]
    fn test_excluded_backends_skipped() {
        let mut f = Fixture::new(2);
        f.excluded = vec![BackendId(1)];
        assert_eq!(f.sql("SELECT 1"), single(2, RouteTarget::Slave));
        f.excluded.push(BackendId(2));
        assert!(matches!(f.sql("SELECT 1"), Err(RoutingError::NoEligibleBackend(_))));
    }

    #[test]
    fn test_hints() {
        let f = Fixture::new(2);
        assert_eq!(
            f.sql("SELECT 1 -- maxscale route to master"),
            single(0, RouteTarget::Master)
        );
        assert_eq!(
            f.sql("SELECT 1 -- maxscale route to server db2"),
            single(2, RouteTarget::NamedServer)
        );
        assert_eq!(
            f.sql("SELECT 1 -- maxscale route to server missing"),
            single(1, RouteTarget::Slave)
        );
        // Writes ignore hints
        assert_eq!(
            f.sql("DELETE FROM t -- maxscale route to slave"),
            single(0, RouteTarget::Master)
        );
    }

    #[test]
    fn test_no_slaves() {
        let f = Fixture::new(0);
        assert!(matches!(f.sql("SELECT 1"), Err(RoutingError::NoEligibleBackend(_))));
    }

    #[test]
    fn test_master_lost() {
        let mut f = Fixture::new(1);
        f.backends[0].close();
        assert_eq!(f.sql("UPDATE t SET a = 1"), Err(RoutingError::MasterUnavailable));
        assert_eq!(f.sql("SELECT 1"), single(1, RouteTarget::Slave));
    }

    #[test]
    fn test_locked_target() {
        let mut f = Fixture::new(1);
        f.locked_target = Some(BackendId(0));
        assert_eq!(
            f.sql("SELECT 1"),
            Err(RoutingError::LoadData(LoadDataError::NotAllowed))
        );
        f.stream_chunk = true;
        let chunk = QueryClassification::raw();
        assert_eq!(f.decide(&chunk), single(0, RouteTarget::Master));

        f.backends[0].close();
        assert_eq!(
            f.decide(&chunk),
            Err(RoutingError::LoadData(LoadDataError::TargetLost))
        );
    }

    #[test]
    fn test_no_ready_backend_for_broadcast() {
        let mut f = Fixture::new(1);
        f.backends[0].close();
        f.backends[1].start_replay();
        let set = QueryClassification::new(
            Command::InitDb,
            [QueryType::SessionWrite].into_iter().collect::<QueryTypes>(),
        );
        assert!(matches!(f.decide(&set), Err(RoutingError::NoEligibleBackend(_))));
    }
}
