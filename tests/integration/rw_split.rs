//! Read/write split integration tests

use crate::{assert_query_error, cleanup_user_id, get_proxy_config, parse_amount, skip_if_not_enabled};
use mysql::prelude::*;

const TEST_PREFIX: &str = "it_rw_";

#[test]
fn test_reads_can_route_to_slave() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let mut server_ids = std::collections::HashSet::new();
    for _ in 0..10 {
        let server_id: Option<u64> = conn
            .query_first("SELECT @@server_id")
            .expect("SELECT @@server_id should succeed");
        server_ids.extend(server_id);
    }

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    let master_id: Option<u64> = conn.query_first("SELECT @@server_id").expect("SELECT should succeed");
    conn.query_drop("COMMIT").expect("COMMIT should succeed");

    if server_ids.iter().any(|id| Some(*id) != master_id) {
        eprintln!("Reads served by a slave: {:?}", server_ids);
    } else {
        eprintln!("All reads served by the master (expected if no slaves are healthy)");
    }
}

#[test]
fn test_write_then_read_in_transaction() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let user_id = format!("{}write", TEST_PREFIX);
    cleanup_user_id(&mut conn, &user_id);

    let sql = format!("INSERT INTO orders (user_id, amount) VALUES ('{}', 100.00)", user_id);
    conn.query_drop(&sql).expect("INSERT should succeed");

    conn.query_drop("START TRANSACTION").expect("START TRANSACTION should succeed");
    let sql = format!("SELECT amount FROM orders WHERE user_id = '{}'", user_id);
    let result: Option<String> = conn.query_first(&sql).expect("SELECT should succeed");
    assert_eq!(result.map(|s| parse_amount(&s)), Some(100));
    conn.query_drop("COMMIT").expect("COMMIT should succeed");

    cleanup_user_id(&mut conn, &user_id);
}

#[test]
fn test_temporary_table_is_readable() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("CREATE TEMPORARY TABLE it_rw_tmp (id INT)")
        .expect("CREATE TEMPORARY TABLE should succeed");
    conn.query_drop("INSERT INTO it_rw_tmp VALUES (1), (2)").expect("INSERT should succeed");

    // Only the master has the table
    for _ in 0..5 {
        let count: Option<u64> = conn
            .query_first("SELECT COUNT(*) FROM it_rw_tmp")
            .expect("SELECT from temporary table should succeed");
        assert_eq!(count, Some(2));
    }

    conn.query_drop("DROP TABLE it_rw_tmp").expect("DROP TABLE should succeed");
}

#[test]
fn test_select_assigning_variable_is_rejected() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let result: Result<Option<u64>, _> = conn.query_first("SELECT @counter := 1");
    assert_query_error(result, 1064, "use_sql_variables_in");

    // The session is still usable
    let one: Option<u64> = conn.query_first("SELECT 1").expect("SELECT should succeed");
    assert_eq!(one, Some(1));
}

#[test]
fn test_prepared_statements() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let user_id = format!("{}prepared", TEST_PREFIX);
    cleanup_user_id(&mut conn, &user_id);

    conn.exec_drop(
        "INSERT INTO orders (user_id, amount) VALUES (?, ?)",
        (&user_id, 42.5),
    )
    .expect("prepared INSERT should succeed");

    conn.query_drop("BEGIN").expect("BEGIN should succeed");
    let amount: Option<String> = conn
        .exec_first("SELECT amount FROM orders WHERE user_id = ?", (&user_id,))
        .expect("prepared SELECT should succeed");
    assert_eq!(amount.map(|s| parse_amount(&s)), Some(42));
    conn.query_drop("COMMIT").expect("COMMIT should succeed");

    cleanup_user_id(&mut conn, &user_id);
}
