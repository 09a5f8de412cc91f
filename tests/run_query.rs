use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use pgtask::drivers::{DriverEventKind, InMemoryTestDriver, InMemoryTestResponseBuilder};
use pgtask::error::PgTaskError;
use pgtask::traits::{DatabaseDriver, QueryTask};
use pgtask::types::{QueryParams, SqlValue};
use pgtask::{run_query, PostgresCredentials, QueryExecutor, QueryRequest, Row, Worker};

fn credentials_with(driver: &Arc<InMemoryTestDriver>) -> PostgresCredentials {
    let driver: Arc<dyn DatabaseDriver> = Arc::clone(driver) as Arc<dyn DatabaseDriver>;
    PostgresCredentials::new("user", "password")
        .with_database("postgres")
        .with_driver(driver)
}

#[tokio::test]
async fn test_returns_rows_in_driver_order() {
    let in_memory_test_driver = Arc::new(
        InMemoryTestDriver::new().with_response(
            InMemoryTestResponseBuilder::new()
                .columns(&["id", "name", "active"])
                .row(vec![3.into(), "Carol".into(), true.into()])
                .row(vec![1.into(), "Alice".into(), SqlValue::Null])
                .row(vec![2.into(), "Bob".into(), false.into()])
                .build(),
        ),
    );
    let credentials = credentials_with(&in_memory_test_driver);

    let rows = run_query(
        "SELECT id, name, active FROM users",
        &credentials,
        QueryParams::None,
        None,
    )
    .await
    .unwrap();

    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows[0],
        Row::new(vec![3.into(), "Carol".into(), true.into()])
    );
    assert_eq!(rows[1].get(1).and_then(SqlValue::as_str), Some("Alice"));
    assert!(rows[1].get(2).unwrap().is_null());
    assert_eq!(rows[2].get(0).and_then(SqlValue::as_i64), Some(2));

    in_memory_test_driver.assert_last_query("SELECT id, name, active FROM users", &[]);
    in_memory_test_driver.assert_all_closed();
}

#[tokio::test]
async fn test_named_params_are_bound_positionally() {
    let in_memory_test_driver = Arc::new(InMemoryTestDriver::new());
    let credentials = credentials_with(&in_memory_test_driver);

    run_query(
        "SELECT * FROM table WHERE id=%(id_param)s LIMIT 8;",
        &credentials,
        QueryParams::named([("id_param", 1)]),
        None,
    )
    .await
    .unwrap();

    in_memory_test_driver.assert_last_query(
        "SELECT * FROM table WHERE id=$1 LIMIT 8;",
        &[SqlValue::Int32(1)],
    );
}

#[tokio::test]
async fn test_positional_params_pass_through() {
    let in_memory_test_driver = Arc::new(InMemoryTestDriver::new());
    let credentials = credentials_with(&in_memory_test_driver);

    run_query(
        "SELECT * FROM users WHERE name = $1 AND age > $2",
        &credentials,
        vec![SqlValue::from("Bob"), SqlValue::Int64(30)],
        None,
    )
    .await
    .unwrap();

    in_memory_test_driver.assert_last_query(
        "SELECT * FROM users WHERE name = $1 AND age > $2",
        &[SqlValue::Text("Bob".to_string()), SqlValue::Int64(30)],
    );
}

#[tokio::test]
async fn test_percent_s_params_are_numbered_before_the_driver() {
    let in_memory_test_driver = Arc::new(InMemoryTestDriver::new());
    let credentials = credentials_with(&in_memory_test_driver);

    run_query(
        "SELECT * FROM t WHERE id = %s AND x LIKE '100%%'",
        &credentials,
        QueryParams::positional([1]),
        None,
    )
    .await
    .unwrap();

    in_memory_test_driver.assert_last_query(
        "SELECT * FROM t WHERE id = $1 AND x LIKE '100%'",
        &[SqlValue::Int32(1)],
    );
    in_memory_test_driver.assert_all_closed();
}

#[tokio::test]
async fn test_percent_s_count_mismatch_fails_before_execute() {
    let in_memory_test_driver = Arc::new(InMemoryTestDriver::new());
    let credentials = credentials_with(&in_memory_test_driver);

    let err = run_query(
        "SELECT * FROM t WHERE a = %s AND b = %s",
        &credentials,
        QueryParams::positional([1]),
        None,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, PgTaskError::QueryFailed(_)));
    assert!(in_memory_test_driver.recorded_queries().is_empty());
    in_memory_test_driver.assert_all_closed();
}

#[tokio::test]
async fn test_empty_result_is_not_an_error() {
    let in_memory_test_driver = Arc::new(InMemoryTestDriver::new().with_response(
        InMemoryTestResponseBuilder::new().columns(&["id"]).build(), // No rows
    ));
    let credentials = credentials_with(&in_memory_test_driver);

    let rows = run_query(
        "SELECT id FROM users WHERE id = $1",
        &credentials,
        vec![SqlValue::Int32(999)],
        None,
    )
    .await
    .unwrap();

    assert!(rows.is_empty());
    in_memory_test_driver.assert_all_closed();
}

#[tokio::test]
async fn test_same_query_twice_yields_same_rows() {
    let in_memory_test_driver = Arc::new(
        InMemoryTestDriver::new().with_default_response(
            InMemoryTestResponseBuilder::new()
                .columns(&["n"])
                .row(vec![1.into()])
                .row(vec![2.into()])
                .build(),
        ),
    );
    let credentials = credentials_with(&in_memory_test_driver);

    let first = run_query("SELECT n FROM t", &credentials, QueryParams::None, None)
        .await
        .unwrap();
    let second = run_query("SELECT n FROM t", &credentials, QueryParams::None, None)
        .await
        .unwrap();

    assert_eq!(first, second);
    in_memory_test_driver.assert_query_count(2);
    // Each run used its own connection
    assert_eq!(in_memory_test_driver.recorded_connects().len(), 2);
    in_memory_test_driver.assert_all_closed();
}

#[tokio::test]
async fn test_malformed_statement_closes_connection() {
    let in_memory_test_driver = Arc::new(
        InMemoryTestDriver::new().failing_execute("syntax error at or near \"SELEC\""),
    );
    let credentials = credentials_with(&in_memory_test_driver);

    let err = run_query("SELEC 1", &credentials, QueryParams::None, None)
        .await
        .unwrap_err();

    match err {
        PgTaskError::QueryFailed(e) => assert!(e.message().contains("SELEC")),
        other => panic!("Expected QueryFailed, got {:?}", other),
    }

    // Fetch is never issued after a failed execute
    assert_eq!(
        in_memory_test_driver.events_for(1),
        vec![
            DriverEventKind::Connect,
            DriverEventKind::Execute,
            DriverEventKind::Close
        ]
    );
    in_memory_test_driver.assert_all_closed();
}

#[tokio::test]
async fn test_missing_named_param_fails_before_execute() {
    let in_memory_test_driver = Arc::new(InMemoryTestDriver::new());
    let credentials = credentials_with(&in_memory_test_driver);

    let err = run_query(
        "SELECT * FROM t WHERE id = %(id)s",
        &credentials,
        QueryParams::named([("other", 1)]),
        None,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, PgTaskError::QueryFailed(_)));
    in_memory_test_driver.assert_query_count(0);
    in_memory_test_driver.assert_all_closed();
}

#[tokio::test]
async fn test_connection_failure_propagates() {
    let in_memory_test_driver =
        Arc::new(InMemoryTestDriver::new().failing_connect("could not connect to server"));
    let credentials = credentials_with(&in_memory_test_driver);

    let err = run_query("SELECT 1", &credentials, QueryParams::None, None)
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "Connection failed: could not connect to server"
    );
    in_memory_test_driver.assert_query_count(0);
    assert_eq!(in_memory_test_driver.open_connections(), 0);
}

#[tokio::test]
async fn test_missing_database_never_connects() {
    let in_memory_test_driver = Arc::new(InMemoryTestDriver::new());
    let credentials = PostgresCredentials::new("user", "password")
        .with_driver(Arc::clone(&in_memory_test_driver) as Arc<dyn DatabaseDriver>);

    let err = run_query("SELECT 1", &credentials, QueryParams::None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, PgTaskError::Configuration(_)));
    assert!(in_memory_test_driver.recorded_connects().is_empty());
}

#[tokio::test]
async fn test_database_override_precedence() {
    let in_memory_test_driver = Arc::new(InMemoryTestDriver::new());
    let configured = credentials_with(&in_memory_test_driver);
    let unconfigured = PostgresCredentials::new("user", "password")
        .with_driver(Arc::clone(&in_memory_test_driver) as Arc<dyn DatabaseDriver>);

    run_query("SELECT 1", &configured, QueryParams::None, Some("override"))
        .await
        .unwrap();
    run_query("SELECT 1", &unconfigured, QueryParams::None, Some("override"))
        .await
        .unwrap();

    let connects = in_memory_test_driver.recorded_connects();
    assert_eq!(connects[0].database, "postgres");
    assert_eq!(connects[1].database, "override");
    // The request never changes the credentials
    assert_eq!(unconfigured.database(), None);
}

#[tokio::test]
async fn test_close_failure_does_not_mask_rows() {
    let in_memory_test_driver = Arc::new(
        InMemoryTestDriver::new()
            .with_response(
                InMemoryTestResponseBuilder::new()
                    .columns(&["ok"])
                    .row(vec![true.into()])
                    .build(),
            )
            .failing_close("server closed the connection unexpectedly"),
    );
    let credentials = credentials_with(&in_memory_test_driver);

    let rows = run_query("SELECT true AS ok", &credentials, QueryParams::None, None)
        .await
        .unwrap();

    assert_eq!(rows, vec![Row::new(vec![SqlValue::Bool(true)])]);
    in_memory_test_driver.assert_all_closed();
}

#[tokio::test]
async fn test_driver_calls_run_off_the_calling_thread() {
    let in_memory_test_driver = Arc::new(InMemoryTestDriver::new());
    let credentials = credentials_with(&in_memory_test_driver);
    let caller = std::thread::current().id();

    run_query("SELECT 1", &credentials, QueryParams::None, None)
        .await
        .unwrap();

    let events = in_memory_test_driver.events();
    assert_eq!(events.len(), 4);
    assert!(events.iter().all(|e| e.thread != caller));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_queries_get_their_own_connection() {
    let mut in_memory_test_driver =
        InMemoryTestDriver::new().with_execute_delay(Duration::from_millis(25));
    for i in 0..8 {
        in_memory_test_driver = in_memory_test_driver.with_query_response(
            format!("SELECT {}", i),
            InMemoryTestResponseBuilder::new()
                .columns(&["n"])
                .row(vec![SqlValue::Int32(i)])
                .build(),
        );
    }
    let in_memory_test_driver = Arc::new(in_memory_test_driver);
    let credentials = credentials_with(&in_memory_test_driver);
    let executor = QueryExecutor::new();

    let runs = (0..8).map(|i| {
        let executor = executor.clone();
        let credentials = credentials.clone();
        async move {
            executor
                .run(QueryRequest::new(format!("SELECT {}", i)), &credentials)
                .await
        }
    });
    let results = join_all(runs).await;

    for (i, result) in results.into_iter().enumerate() {
        let rows = result.unwrap();
        assert_eq!(rows, vec![Row::new(vec![SqlValue::Int32(i as i32)])]);
    }

    let queries = in_memory_test_driver.recorded_queries();
    let mut connections: Vec<usize> = queries.iter().map(|q| q.connection).collect();
    connections.sort_unstable();
    connections.dedup();
    assert_eq!(connections.len(), 8);

    for connection in connections {
        assert_eq!(
            in_memory_test_driver.events_for(connection),
            vec![
                DriverEventKind::Connect,
                DriverEventKind::Execute,
                DriverEventKind::Fetch,
                DriverEventKind::Close
            ]
        );
    }
    in_memory_test_driver.assert_all_closed();
}

#[tokio::test]
async fn test_cancelled_query_still_closes_connection() {
    let in_memory_test_driver =
        Arc::new(InMemoryTestDriver::new().with_execute_delay(Duration::from_millis(150)));
    let credentials = credentials_with(&in_memory_test_driver);

    let outcome = tokio::time::timeout(
        Duration::from_millis(20),
        run_query("SELECT pg_sleep(1)", &credentials, QueryParams::None, None),
    )
    .await;
    assert!(outcome.is_err(), "query should still have been running");

    // The blocking execute finishes on its own, then the connection is released
    for _ in 0..100 {
        if in_memory_test_driver.open_connections() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    in_memory_test_driver.assert_query_count(1);
    in_memory_test_driver.assert_all_closed();
    assert!(!in_memory_test_driver
        .events()
        .iter()
        .any(|e| e.kind == DriverEventKind::Fetch));
}

#[tokio::test]
async fn test_executor_as_query_task() {
    let in_memory_test_driver = Arc::new(
        InMemoryTestDriver::new().with_response(
            InMemoryTestResponseBuilder::new()
                .columns(&["name"])
                .row(vec!["Admin".into()])
                .build(),
        ),
    );
    let credentials = PostgresCredentials::new("user", "password")
        .with_driver(Arc::clone(&in_memory_test_driver) as Arc<dyn DatabaseDriver>);
    let task: Arc<dyn QueryTask> = Arc::new(QueryExecutor::with_worker(Worker::with_limit(4)));

    let rows = task
        .run_query(
            QueryRequest::new("SELECT name FROM users WHERE id = %(id)s")
                .with_params(QueryParams::named([("id", 1)]))
                .with_database("app"),
            &credentials,
        )
        .await
        .unwrap();

    assert_eq!(rows[0].get(0).and_then(SqlValue::as_str), Some("Admin"));
    assert_eq!(in_memory_test_driver.recorded_connects()[0].database, "app");
    in_memory_test_driver.assert_last_query(
        "SELECT name FROM users WHERE id = $1",
        &[SqlValue::Int32(1)],
    );
}
