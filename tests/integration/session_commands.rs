//! Session state must look the same whichever backend answers

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

#[test]
fn test_user_variable_visible_on_every_read() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("SET @it_value = 42").expect("SET should succeed");
    for _ in 0..10 {
        let value: Option<u64> = conn.query_first("SELECT @it_value").expect("SELECT should succeed");
        assert_eq!(value, Some(42));
    }
}

#[test]
fn test_repeated_session_command() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    for i in 0..3 {
        conn.query_drop("SET @it_repeat = 1").expect("SET should succeed");
        let value: Option<u64> = conn.query_first("SELECT @it_repeat").expect("SELECT should succeed");
        assert_eq!(value, Some(1), "iteration {}", i);
    }
}

#[test]
fn test_default_database_change_reaches_every_backend() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("USE information_schema").expect("USE should succeed");
    for _ in 0..10 {
        let db: Option<String> = conn.query_first("SELECT DATABASE()").expect("SELECT should succeed");
        assert_eq!(db.as_deref(), Some("information_schema"));
    }
    conn.query_drop(format!("USE {}", config.database)).expect("USE should succeed");
}

#[test]
fn test_session_variable_change() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("SET SESSION sql_mode = 'ANSI_QUOTES'").expect("SET should succeed");
    for _ in 0..5 {
        let mode: Option<String> = conn.query_first("SELECT @@SESSION.sql_mode").expect("SELECT should succeed");
        assert_eq!(mode.as_deref(), Some("ANSI_QUOTES"));
    }
}
