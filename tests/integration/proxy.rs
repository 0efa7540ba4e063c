//! End-to-end tests against a live proxy + backend pair.
//!
//! Topology: a Portico instance listening on PORTICO_TEST_PROXY_PORT,
//! fronting at least one MySQL/MariaDB backend whose credential table
//! contains PORTICO_TEST_USER.

use mysql::prelude::*;
use mysql::{Opts, Pool};

use crate::{get_proxy_config, should_run_integration_tests};

fn pool() -> Pool {
    let config = get_proxy_config();
    let opts = Opts::from_url(&config.url()).expect("invalid test URL");
    Pool::new(opts).expect("failed to connect through proxy")
}

#[test]
fn test_select_round_trip() {
    if !should_run_integration_tests() {
        return;
    }

    let pool = pool();
    let mut conn = pool.get_conn().unwrap();

    let value: Option<i64> = conn.query_first("SELECT 1").unwrap();
    assert_eq!(value, Some(1));
}

#[test]
fn test_prepared_statement_through_proxy() {
    if !should_run_integration_tests() {
        return;
    }

    let pool = pool();
    let mut conn = pool.get_conn().unwrap();

    let stmt = conn.prep("SELECT ? + 1").unwrap();
    let value: Option<i64> = conn.exec_first(&stmt, (41,)).unwrap();
    assert_eq!(value, Some(42));
}

#[test]
fn test_result_set_shape_preserved() {
    if !should_run_integration_tests() {
        return;
    }

    let pool = pool();
    let mut conn = pool.get_conn().unwrap();

    let rows: Vec<(i64, String)> = conn
        .query("SELECT 1, 'one' UNION ALL SELECT 2, 'two'")
        .unwrap();
    assert_eq!(rows, vec![(1, "one".to_string()), (2, "two".to_string())]);
}

#[test]
fn test_pooled_connection_reuse() {
    if !should_run_integration_tests() {
        return;
    }

    // Two sequential sessions: the second should land on the parked
    // backend connection and still behave like a fresh one.
    let config = get_proxy_config();
    for _ in 0..2 {
        let opts = Opts::from_url(&config.url()).unwrap();
        let pool = Pool::new(opts).unwrap();
        let mut conn = pool.get_conn().unwrap();
        let value: Option<i64> = conn.query_first("SELECT 2").unwrap();
        assert_eq!(value, Some(2));
        drop(conn);
        drop(pool);
    }
}

#[test]
fn test_wrong_password_refused() {
    if !should_run_integration_tests() {
        return;
    }

    let mut config = get_proxy_config();
    config.password = format!("{}-wrong", config.password);
    let opts = Opts::from_url(&config.url()).unwrap();
    assert!(Pool::new(opts).and_then(|p| p.get_conn()).is_err());
}
