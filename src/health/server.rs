//! Backend servers known to the router and their monitored status

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{HealthCheckConfig, ServerEntry, ServerRole};

use super::state::{HealthStatus, HealthWindow, WindowConfig};

/// Monitored view of a server, refreshed by the monitor task
#[derive(Debug, Clone, Default)]
pub struct ServerStatus {
    /// Role reported by the server itself, once detected
    pub detected_role: Option<ServerRole>,
    /// Seconds_Behind_Master; None when unknown or not replicating
    pub replication_lag: Option<u64>,
    pub health: HealthWindow,
}

/// One backend database server shared by every session.
///
/// The connection and operation counters feed the slave selection criteria:
/// `connections` counts every link the process holds to the server,
/// `router_connections` only those opened by client sessions.
#[derive(Debug)]
pub struct Server {
    name: String,
    host: String,
    port: u16,
    configured_role: ServerRole,
    status: RwLock<ServerStatus>,
    connections: AtomicUsize,
    router_connections: AtomicUsize,
    current_operations: AtomicUsize,
}

impl Server {
    pub fn new(entry: &ServerEntry, window: WindowConfig) -> Self {
        Self {
            name: entry.name.clone(),
            host: entry.host.clone(),
            port: entry.port,
            configured_role: entry.role,
            status: RwLock::new(ServerStatus {
                health: HealthWindow::new(window),
                ..ServerStatus::default()
            }),
            connections: AtomicUsize::new(0),
            router_connections: AtomicUsize::new(0),
            current_operations: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Detected role, falling back to the configured one
    pub fn role(&self) -> ServerRole {
        self.status.read().detected_role.unwrap_or(self.configured_role)
    }

    pub fn replication_lag(&self) -> Option<u64> {
        self.status.read().replication_lag
    }

    pub fn health_status(&self) -> HealthStatus {
        self.status.read().health.status()
    }

    /// Usable for new connections
    pub fn is_available(&self) -> bool {
        self.status.read().health.is_available()
    }

    pub fn global_connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn router_connections(&self) -> usize {
        self.router_connections.load(Ordering::Relaxed)
    }

    pub fn current_operations(&self) -> usize {
        self.current_operations.load(Ordering::Relaxed)
    }

    /// Apply one monitor result. Returns true if the health status changed.
    pub fn record_check(&self, outcome: Option<(ServerRole, Option<u64>)>) -> bool {
        let mut status = self.status.write();
        match outcome {
            Some((role, lag)) => {
                status.detected_role = Some(role);
                status.replication_lag = lag;
                status.health.record_success()
            }
            None => status.health.record_failure(),
        }
    }

    #[cfg(test)]
    pub fn set_replication_lag(&self, lag: Option<u64>) {
        self.status.write().replication_lag = lag;
    }
}

/// Counts one link to a server for as long as it is alive
#[derive(Debug)]
pub struct ConnectionSlot {
    server: Arc<Server>,
    session: bool,
}

impl ConnectionSlot {
    /// Link opened on behalf of a client session
    pub fn session(server: Arc<Server>) -> Self {
        server.connections.fetch_add(1, Ordering::Relaxed);
        server.router_connections.fetch_add(1, Ordering::Relaxed);
        Self { server, session: true }
    }

    /// Link used by the monitor
    pub fn monitor(server: Arc<Server>) -> Self {
        server.connections.fetch_add(1, Ordering::Relaxed);
        Self { server, session: false }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.server.connections.fetch_sub(1, Ordering::Relaxed);
        if self.session {
            self.server.router_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Counts one outstanding operation on a server
#[derive(Debug)]
pub struct OperationGuard {
    server: Arc<Server>,
}

impl OperationGuard {
    pub fn new(server: Arc<Server>) -> Self {
        server.current_operations.fetch_add(1, Ordering::Relaxed);
        Self { server }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.server.current_operations.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Every configured server, in configuration order
#[derive(Debug, Default)]
pub struct ServerDirectory {
    servers: Vec<Arc<Server>>,
}

impl ServerDirectory {
    pub fn new(entries: &[ServerEntry], health: &HealthCheckConfig) -> Self {
        let window = WindowConfig::from_failure_threshold(health.failure_threshold);
        Self {
            servers: entries
                .iter()
                .map(|entry| Arc::new(Server::new(entry, window.clone())))
                .collect(),
        }
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<Server>> {
        self.servers.iter().find(|s| s.name() == name)
    }

    /// First available server currently acting as master
    pub fn master(&self) -> Option<&Arc<Server>> {
        self.servers
            .iter()
            .find(|s| s.role() == ServerRole::Master && s.is_available())
    }

    /// Available servers currently acting as slaves
    pub fn slaves(&self) -> impl Iterator<Item = &Arc<Server>> {
        self.servers
            .iter()
            .filter(|s| s.role() == ServerRole::Slave && s.is_available())
    }

    pub fn slave_count(&self) -> usize {
        self.servers
            .iter()
            .filter(|s| s.role() == ServerRole::Slave)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, role: ServerRole) -> ServerEntry {
        ServerEntry {
            name: name.into(),
            host: "127.0.0.1".into(),
            port: 3306,
            role,
        }
    }

    #[test]
    fn test_detected_role_overrides_configured() {
        let server = Server::new(&entry("a", ServerRole::Master), WindowConfig::default());
        assert_eq!(server.role(), ServerRole::Master);
        server.record_check(Some((ServerRole::Slave, Some(4))));
        assert_eq!(server.role(), ServerRole::Slave);
        assert_eq!(server.replication_lag(), Some(4));
    }

    #[test]
    fn test_guards_release_counters() {
        let server = Arc::new(Server::new(&entry("a", ServerRole::Slave), WindowConfig::default()));
        {
            let _session = ConnectionSlot::session(server.clone());
            let _monitor = ConnectionSlot::monitor(server.clone());
            let _op = OperationGuard::new(server.clone());
            assert_eq!(server.global_connections(), 2);
            assert_eq!(server.router_connections(), 1);
            assert_eq!(server.current_operations(), 1);
        }
        assert_eq!(server.global_connections(), 0);
        assert_eq!(server.router_connections(), 0);
        assert_eq!(server.current_operations(), 0);
    }

    #[test]
    fn test_directory_lookup() {
        let directory = ServerDirectory::new(
            &[entry("m", ServerRole::Master), entry("s1", ServerRole::Slave), entry("s2", ServerRole::Slave)],
            &HealthCheckConfig::default(),
        );
        assert_eq!(directory.master().map(|s| s.name()), Some("m"));
        assert_eq!(directory.slaves().count(), 2);
        assert_eq!(directory.slave_count(), 2);
        assert!(directory.by_name("s2").is_some());
        assert!(directory.by_name("nope").is_none());
    }
}
