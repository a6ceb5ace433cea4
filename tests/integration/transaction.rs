//! Transaction integration tests

use crate::{cleanup_user_id, get_proxy_config, parse_amount, skip_if_not_enabled};
use mysql::prelude::*;

const TEST_PREFIX: &str = "it_tx_";

#[test]
fn test_transaction_rollback() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let user_id = format!("{}rollback", TEST_PREFIX);
    cleanup_user_id(&mut conn, &user_id);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");

    let sql = format!("INSERT INTO orders (user_id, amount) VALUES ('{}', 100.00)", user_id);
    conn.query_drop(&sql).expect("INSERT should succeed");

    let sql = format!("SELECT amount FROM orders WHERE user_id = '{}'", user_id);
    let result: Option<String> = conn.query_first(&sql).expect("SELECT should succeed");
    assert_eq!(result.map(|s| parse_amount(&s)), Some(100));

    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    let result: Option<String> = conn.query_first(&sql).expect("SELECT should succeed");
    assert_eq!(result, None, "Data should be rolled back");
    conn.query_drop("COMMIT").expect("COMMIT should succeed");
}

#[test]
fn test_read_your_writes_in_transaction() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let user_id = format!("{}ryw", TEST_PREFIX);
    cleanup_user_id(&mut conn, &user_id);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");

    let sql = format!("INSERT INTO orders (user_id, amount) VALUES ('{}', 100.00)", user_id);
    conn.query_drop(&sql).expect("INSERT should succeed");

    let sql = format!("UPDATE orders SET amount = 200.00 WHERE user_id = '{}'", user_id);
    conn.query_drop(&sql).expect("UPDATE should succeed");

    let sql = format!("SELECT amount FROM orders WHERE user_id = '{}'", user_id);
    let value: Option<String> = conn.query_first(&sql).expect("SELECT should succeed");
    assert_eq!(value.map(|s| parse_amount(&s)), Some(200));

    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");
}

#[test]
fn test_autocommit_off_keeps_reads_on_master() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let user_id = format!("{}autocommit", TEST_PREFIX);
    cleanup_user_id(&mut conn, &user_id);

    conn.query_drop("SET autocommit = 0").expect("SET autocommit should succeed");
    let sql = format!("INSERT INTO orders (user_id, amount) VALUES ('{}', 300.00)", user_id);
    conn.query_drop(&sql).expect("INSERT should succeed");

    // Uncommitted, so only visible on the master
    let sql = format!("SELECT amount FROM orders WHERE user_id = '{}'", user_id);
    let value: Option<String> = conn.query_first(&sql).expect("SELECT should succeed");
    assert_eq!(value.map(|s| parse_amount(&s)), Some(300));

    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");
    conn.query_drop("SET autocommit = 1").expect("SET autocommit should succeed");
}

#[test]
fn test_failed_statement_keeps_transaction() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let user_id = format!("{}failed", TEST_PREFIX);
    cleanup_user_id(&mut conn, &user_id);

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    let sql = format!("INSERT INTO orders (user_id, amount) VALUES ('{}', 10.00)", user_id);
    conn.query_drop(&sql).expect("INSERT should succeed");

    assert!(conn.query_drop("INSERT INTO no_such_table VALUES (1)").is_err());

    let sql = format!("SELECT amount FROM orders WHERE user_id = '{}'", user_id);
    let value: Option<String> = conn.query_first(&sql).expect("SELECT should succeed");
    assert_eq!(value.map(|s| parse_amount(&s)), Some(10));

    conn.query_drop("ROLLBACK").expect("ROLLBACK should succeed");
}
