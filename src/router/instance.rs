//! Process-wide router state shared by all sessions

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::classifier::{SqlClassifier, StatementClassifier};
use crate::config::{BackendConfig, Config, RouterConfig};
use crate::filter::{FilterChain, MaskingError, MaskingFilter, MaskingRule};
use crate::health::{Server, ServerDirectory};

use super::selector::{rank, select_best};
use super::target::RouteTarget;

/// Aggregate counters, updated by every session
#[derive(Debug, Default)]
pub struct RouterStats {
    n_sessions: AtomicU64,
    n_queries: AtomicU64,
    n_master: AtomicU64,
    n_slave: AtomicU64,
    n_all: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub n_sessions: u64,
    pub n_queries: u64,
    pub n_master: u64,
    pub n_slave: u64,
    pub n_all: u64,
}

impl RouterStats {
    pub fn record_session(&self) {
        self.n_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self) {
        self.n_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_route(&self, target: RouteTarget) {
        let counter = match target {
            RouteTarget::Master => &self.n_master,
            RouteTarget::All => &self.n_all,
            RouteTarget::Slave | RouteTarget::NamedServer | RouteTarget::RlagMax => &self.n_slave,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            n_sessions: self.n_sessions.load(Ordering::Relaxed),
            n_queries: self.n_queries.load(Ordering::Relaxed),
            n_master: self.n_master.load(Ordering::Relaxed),
            n_slave: self.n_slave.load(Ordering::Relaxed),
            n_all: self.n_all.load(Ordering::Relaxed),
        }
    }
}

/// Registry entry of a live session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub user: String,
    pub host: String,
    pub started: Instant,
}

/// Removes the session from the registry when dropped
#[derive(Debug)]
pub struct SessionRegistration {
    id: u32,
    sessions: Arc<DashMap<u32, SessionInfo>>,
}

impl Drop for SessionRegistration {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
    }
}

pub struct RouterInstance {
    config: RouterConfig,
    backend: BackendConfig,
    directory: Arc<ServerDirectory>,
    classifier: Arc<dyn StatementClassifier>,
    masking: Vec<Arc<MaskingRule>>,
    stats: RouterStats,
    sessions: Arc<DashMap<u32, SessionInfo>>,
    next_session_id: AtomicU32,
}

impl RouterInstance {
    pub fn new(config: &Config, directory: Arc<ServerDirectory>) -> Result<Self, MaskingError> {
        let masking = config
            .masking
            .rules
            .iter()
            .map(|rule| MaskingRule::from_config(rule).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            servers = directory.servers().len(),
            masking_rules = masking.len(),
            criteria = ?config.router.slave_selection_criteria,
            "Router instance created"
        );
        Ok(Self {
            config: config.router.clone(),
            backend: config.backend.clone(),
            directory,
            classifier: Arc::new(SqlClassifier::new()),
            masking,
            stats: RouterStats::default(),
            sessions: Arc::new(DashMap::new()),
            next_session_id: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn backend_config(&self) -> &BackendConfig {
        &self.backend
    }

    pub fn directory(&self) -> &Arc<ServerDirectory> {
        &self.directory
    }

    pub fn classifier(&self) -> &dyn StatementClassifier {
        self.classifier.as_ref()
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    pub fn next_session_id(&self) -> u32 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_session(&self, id: u32, user: &str, host: &str) -> SessionRegistration {
        self.stats.record_session();
        self.sessions.insert(
            id,
            SessionInfo {
                user: user.to_string(),
                host: host.to_string(),
                started: Instant::now(),
            },
        );
        SessionRegistration {
            id,
            sessions: self.sessions.clone(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Live sessions ordered by id
    pub fn sessions(&self) -> Vec<(u32, SessionInfo)> {
        let mut sessions: Vec<(u32, SessionInfo)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        sessions.sort_by_key(|(id, _)| *id);
        sessions
    }

    /// Filters for a session of this account
    pub fn filters_for(&self, user: &str, host: &str) -> FilterChain {
        let mut chain = FilterChain::new();
        if let Some(masking) = MaskingFilter::for_account(&self.masking, user, host) {
            chain.push(Box::new(masking));
        }
        chain
    }

    /// Servers a new session connects to: the master, then the best slaves
    /// up to max_slave_connections
    pub fn initial_servers(&self) -> (Option<Arc<Server>>, Vec<Arc<Server>>) {
        let master = self.directory.master().cloned();
        let slaves: Vec<Arc<Server>> = self
            .directory
            .slaves()
            .filter(|s| master.as_ref().map_or(true, |m| !Arc::ptr_eq(m, s)))
            .cloned()
            .collect();
        let limit = self.config.max_slave_connections.resolve(self.directory.slave_count());
        let chosen: Vec<Arc<Server>> = rank(self.config.slave_selection_criteria, &slaves)
            .into_iter()
            .take(limit)
            .map(|index| slaves[index].clone())
            .collect();
        debug!(
            master = ?master.as_ref().map(|m| m.name().to_string()),
            slaves = chosen.len(),
            limit,
            "Initial servers"
        );
        (master, chosen)
    }

    /// Best available slave the session is not attached to yet
    pub fn replacement_server(&self, attached: &[&str]) -> Option<Arc<Server>> {
        let candidates: Vec<Arc<Server>> = self
            .directory
            .slaves()
            .filter(|s| !attached.contains(&s.name()))
            .cloned()
            .collect();
        select_best(self.config.slave_selection_criteria, &candidates).map(|index| candidates[index].clone())
    }
}

impl std::fmt::Debug for RouterInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterInstance")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
