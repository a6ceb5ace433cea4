use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Credentials for backend links
    #[serde(default)]
    pub backend: BackendConfig,
    /// Servers behind the router
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub health: HealthCheckConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Proxy-level credentials; any client is accepted when absent
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub masking: MaskingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_port() -> u16 {
    3307
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Database used when the client does not name one
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            password: String::new(),
            database: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// One backend database server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    /// Role assumed until the monitor has detected one
    #[serde(default)]
    pub role: ServerRole,
}

fn default_mysql_port() -> u16 {
    3306
}

impl ServerEntry {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    #[default]
    Master,
    Slave,
}

impl ServerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerRole::Master => "master",
            ServerRole::Slave => "slave",
        }
    }
}

// ============================================================================
// Router Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub slave_selection_criteria: SelectCriteria,
    #[serde(default)]
    pub max_slave_connections: SlaveLimit,
    /// Seconds; slaves lagging further behind are not used for reads
    #[serde(default)]
    pub max_slave_replication_lag: Option<u64>,
    #[serde(default)]
    pub use_sql_variables_in: SqlVariablesIn,
    /// 0 means unlimited
    #[serde(default)]
    pub max_sescmd_history: usize,
    /// Evict the oldest history entry instead of rejecting new session commands
    #[serde(default)]
    pub prune_sescmd_history: bool,
    /// Broadcast session commands without keeping them for replay
    #[serde(default)]
    pub disable_sescmd_history: bool,
    #[serde(default)]
    pub master_accept_reads: bool,
    #[serde(default = "default_true")]
    pub strict_multi_stmt: bool,
    #[serde(default)]
    pub master_failure_mode: FailureMode,
    #[serde(default = "default_true")]
    pub retry_failed_reads: bool,
    /// Seconds; 0 disables keepalive probes
    #[serde(default = "default_connection_keepalive")]
    pub connection_keepalive: u64,
}

fn default_true() -> bool {
    true
}

fn default_connection_keepalive() -> u64 {
    300
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            slave_selection_criteria: SelectCriteria::default(),
            max_slave_connections: SlaveLimit::default(),
            max_slave_replication_lag: None,
            use_sql_variables_in: SqlVariablesIn::default(),
            max_sescmd_history: 0,
            prune_sescmd_history: false,
            disable_sescmd_history: false,
            master_accept_reads: false,
            strict_multi_stmt: true,
            master_failure_mode: FailureMode::default(),
            retry_failed_reads: true,
            connection_keepalive: default_connection_keepalive(),
        }
    }
}

impl RouterConfig {
    pub fn keepalive(&self) -> Option<Duration> {
        (self.connection_keepalive > 0).then(|| Duration::from_secs(self.connection_keepalive))
    }
}

/// Metric used to rank slaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectCriteria {
    LeastGlobalConnections,
    LeastRouterConnections,
    LeastBehindMaster,
    #[default]
    LeastCurrentOperations,
}

/// Where statements touching user variables go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SqlVariablesIn {
    Master,
    #[default]
    All,
}

/// Session behaviour once the master connection is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    #[default]
    FailInstantly,
    FailOnWrite,
    ErrorOnWrite,
}

/// Number of slaves a session connects to: a count, or a percentage of
/// the configured slaves written as `"50%"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSlaveLimit")]
pub enum SlaveLimit {
    Count(usize),
    Percent(u8),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSlaveLimit {
    Count(usize),
    Text(String),
}

impl TryFrom<RawSlaveLimit> for SlaveLimit {
    type Error = String;

    fn try_from(raw: RawSlaveLimit) -> Result<Self, Self::Error> {
        match raw {
            RawSlaveLimit::Count(n) => Ok(SlaveLimit::Count(n)),
            RawSlaveLimit::Text(text) => {
                let text = text.trim();
                if let Some(percent) = text.strip_suffix('%') {
                    match percent.trim().parse::<u8>() {
                        Ok(p) if p <= 100 => Ok(SlaveLimit::Percent(p)),
                        _ => Err(format!("invalid slave percentage '{}'", text)),
                    }
                } else {
                    text.parse()
                        .map(SlaveLimit::Count)
                        .map_err(|_| format!("invalid slave count '{}'", text))
                }
            }
        }
    }
}

impl Default for SlaveLimit {
    fn default() -> Self {
        SlaveLimit::Count(1)
    }
}

impl SlaveLimit {
    /// Resolve against the number of configured slaves. A non-zero
    /// percentage always yields at least one slave.
    pub fn resolve(self, total_slaves: usize) -> usize {
        match self {
            SlaveLimit::Count(n) => n.min(total_slaves),
            SlaveLimit::Percent(0) => 0,
            SlaveLimit::Percent(p) => ((total_slaves * p as usize) / 100).max(1).min(total_slaves),
        }
    }
}

// ============================================================================
// Health Check Configuration
// ============================================================================

/// Monitor settings for backend servers
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    /// Interval between checks (milliseconds)
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Failures in the window before a server counts as down
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Timeout for each check (milliseconds)
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

fn default_health_enabled() -> bool {
    true
}

fn default_check_interval_ms() -> u64 {
    5000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_check_timeout_ms() -> u64 {
    3000
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            check_interval_ms: default_check_interval_ms(),
            failure_threshold: default_failure_threshold(),
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

// ============================================================================
// Metrics / Auth / Masking
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9104".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MaskingConfig {
    #[serde(default)]
    pub rules: Vec<MaskingRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaskingRuleConfig {
    pub column: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    /// Accounts as `'user'@'host'`, `%` and `_` acting as wildcards.
    /// Empty means every account.
    #[serde(default)]
    pub applies_to: Vec<String>,
    #[serde(default)]
    pub exempted: Vec<String>,
    pub rewrite: RewriteConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RewriteConfig {
    Replace {
        #[serde(default)]
        value: Option<String>,
        #[serde(default = "default_fill")]
        fill: String,
    },
    Obfuscate,
    Capture {
        pattern: String,
        #[serde(default = "default_fill")]
        fill: String,
    },
}

fn default_fill() -> String {
    "X".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: default_listen_port(),
            },
            backend: BackendConfig::default(),
            servers: vec![ServerEntry {
                name: "server1".to_string(),
                host: "127.0.0.1".to_string(),
                port: default_mysql_port(),
                role: ServerRole::Master,
            }],
            router: RouterConfig::default(),
            health: HealthCheckConfig::default(),
            metrics: MetricsConfig::default(),
            auth: None,
            masking: MaskingConfig::default(),
        }
    }
}
