//! Integration test entry point
//!
//! Run with: RWSPLIT_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! The proxy must be running against a master with at least one replica and
//! a database containing:
//!
//! ```sql
//! CREATE TABLE orders (id INT AUTO_INCREMENT PRIMARY KEY, user_id VARCHAR(64), amount DECIMAL(10,2));
//! ```
//!
//! Environment variables:
//! - RWSPLIT_RUN_INTEGRATION_TESTS: Set to "1" to enable integration tests
//! - RWSPLIT_TEST_PROXY_HOST: Proxy host (default: 127.0.0.1)
//! - RWSPLIT_TEST_PROXY_PORT: Proxy port (default: 3307)
//! - RWSPLIT_TEST_PROXY_USER: Proxy user (default: app)
//! - RWSPLIT_TEST_PROXY_PASS: Proxy password (default: secret)
//! - RWSPLIT_TEST_PROXY_DB: Database (default: rwsplit_test)

mod rw_split;
mod session_commands;
mod transaction;

use mysql::{Error as MySqlError, OptsBuilder, Pool, PooledConn};
use std::env;

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("RWSPLIT_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if integration tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!("Skipping integration test (set RWSPLIT_RUN_INTEGRATION_TESTS=1 to run)");
            return;
        }
    };
}

/// Get proxy connection config from environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("RWSPLIT_TEST_PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("RWSPLIT_TEST_PROXY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3307),
        user: env::var("RWSPLIT_TEST_PROXY_USER").unwrap_or_else(|_| "app".to_string()),
        password: env::var("RWSPLIT_TEST_PROXY_PASS").unwrap_or_else(|_| "secret".to_string()),
        database: env::var("RWSPLIT_TEST_PROXY_DB").unwrap_or_else(|_| "rwsplit_test".to_string()),
    }
}

/// Proxy test configuration
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl ProxyTestConfig {
    /// Create a connection pool to the proxy
    pub fn pool(&self) -> Pool {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(&self.host))
            .tcp_port(self.port)
            .user(Some(&self.user))
            .pass(Some(&self.password))
            .db_name(Some(&self.database));
        Pool::new(opts).expect("Failed to create connection pool")
    }

    /// Get a single connection to the proxy
    pub fn conn(&self) -> PooledConn {
        self.pool().get_conn().expect("Failed to get connection")
    }
}

pub fn cleanup_user_id(conn: &mut PooledConn, user_id: &str) {
    use mysql::prelude::Queryable;
    let sql = format!("DELETE FROM orders WHERE user_id = '{}'", user_id);
    let _ = conn.query_drop(&sql);
}

pub fn parse_amount(s: &str) -> i64 {
    s.parse::<f64>().unwrap_or(0.0) as i64
}

/// Assert that a query result is a MySQL error with given code and message
pub fn assert_query_error<T: std::fmt::Debug>(
    result: Result<T, MySqlError>,
    expected_code: u16,
    expected_msg: &str,
) {
    match result {
        Ok(v) => panic!(
            "Expected MySQL error {} with message containing '{}', but got: {:?}",
            expected_code, expected_msg, v
        ),
        Err(MySqlError::MySqlError(ref e)) => {
            assert_eq!(
                e.code, expected_code,
                "Expected error code {}, got {}. Message: {}",
                expected_code, e.code, e.message
            );
            assert!(
                e.message.contains(expected_msg),
                "Expected message containing '{}', got: {}",
                expected_msg,
                e.message
            );
        }
        Err(e) => panic!(
            "Expected MySQL error {} with message containing '{}', got different error: {:?}",
            expected_code, expected_msg, e
        ),
    }
}
