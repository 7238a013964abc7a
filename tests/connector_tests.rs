use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use epicars_connector::{
    Connection, Connector, ConnectorBuilder, ConnectorConfig, DataType, Error, Property,
    PropertyChange, Request, RequestKind, Response, State, Status, Value,
    providers::MemoryProvider,
};
use proptest::prelude::*;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

fn config() -> ConnectorConfig {
    ConnectorConfig {
        core_threads: Some(1),
        max_threads: Some(4),
        timeout: Some(Duration::from_secs(1)),
        connection_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    }
}

fn connector_with(provider: &MemoryProvider, config: ConnectorConfig) -> Connector {
    init_tracing();
    ConnectorBuilder::new(provider.clone())
        .settings(config.resolve_with(|_| None))
        .build()
}

#[test]
fn one_shot_read() {
    let provider = MemoryProvider::new();
    provider.add_pv("BEAM:CURRENT", 302.5f64).unwrap();
    let connector = connector_with(&provider, config());
    assert_eq!(
        connector
            .get_value("BEAM:CURRENT", DataType::Double)
            .unwrap(),
        Value::Double(302.5)
    );
    assert!(matches!(
        connector.get_value("MISSING", DataType::Double),
        Err(Error::Connectivity { .. })
    ));
}

#[test]
fn shutdown_delivers_closed_to_status_listeners() {
    let provider = MemoryProvider::new();
    provider.add_pv("SHUTTER", 1i32).unwrap();
    for _ in 0..20 {
        let connector = connector_with(&provider, config());
        let connection = connector.new_connection("SHUTTER", DataType::Long).unwrap();
        assert!(connection.wait_till_connected());
        let closed = Arc::new(AtomicBool::new(false));
        let seen = closed.clone();
        connection.add_property_change_listener(
            Property::Status,
            move |_: &Connection, change: &PropertyChange| {
                if let PropertyChange::Status { new, .. } = change
                    && new.is_set(State::Closed)
                {
                    seen.store(true, Ordering::SeqCst);
                }
            },
        );
        connector.shutdown();
        assert!(closed.load(Ordering::SeqCst));
    }
}

#[test]
fn cache_shares_connections() {
    let provider = MemoryProvider::new();
    provider.add_pv("SHARED", 1i32).unwrap();
    init_tracing();
    let connector = ConnectorBuilder::new(provider.clone())
        .settings(config().resolve_with(|_| None))
        .cache(true)
        .build();
    let first = connector.new_connection("SHARED", DataType::Long).unwrap();
    let second = connector.new_connection("SHARED", DataType::Long).unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(connector.cache().unwrap().len(), 1);

    first.destroy();
    let third = connector.new_connection("SHARED", DataType::Long).unwrap();
    assert!(!third.ptr_eq(&first));
    assert!(third.wait_till_connected());

    // One-shot reads never touch the cache
    connector.get_value("SHARED", DataType::Long).unwrap();
    assert!(connector.cache().unwrap().get("SHARED").unwrap().ptr_eq(&third));
}

#[test]
fn uncached_connections_are_distinct() {
    let provider = MemoryProvider::new();
    provider.add_pv("PLAIN", 1i32).unwrap();
    let connector = connector_with(&provider, config());
    assert!(connector.cache().is_none());
    let first = connector.new_connection("PLAIN", DataType::Long).unwrap();
    let second = connector.new_connection("PLAIN", DataType::Long).unwrap();
    assert!(!first.ptr_eq(&second));
}

#[test]
fn disabled_pool_runs_on_the_scheduler() {
    let provider = MemoryProvider::new();
    provider.add_pv("SOLO", 8i32).unwrap();
    let connector = connector_with(
        &provider,
        ConnectorConfig {
            core_threads: Some(5),
            max_threads: Some(0),
            ..config()
        },
    );
    assert_eq!(connector.config().core_threads, 0);
    assert!(matches!(
        connector.executor(),
        Err(Error::LifecycleViolation(_))
    ));
    let connection = connector.new_connection("SOLO", DataType::Long).unwrap();
    assert!(connection.wait_till_connected());
    assert_eq!(connection.get_value().unwrap(), Value::Long(8));

    let ghost = connector.new_connection("GHOST", DataType::Long).unwrap();
    assert!(!ghost.wait_till_connected());
    assert!(ghost.status().is_set(State::Failed));
}

#[test]
fn shutdown_closes_everything() {
    let provider = MemoryProvider::new();
    provider.add_pv("A", 1i32).unwrap();
    provider.add_pv("B", 2i32).unwrap();
    let connector = connector_with(&provider, config());
    let a = connector.new_connection("A", DataType::Long).unwrap();
    let b = connector.new_connection("B", DataType::Long).unwrap();
    a.add_property_change_listener(
        epicars_connector::Property::Value,
        |_: &epicars_connector::Connection, _: &epicars_connector::PropertyChange| (),
    );
    assert!(a.wait_till_connected() && b.wait_till_connected());

    connector.shutdown();
    connector.shutdown();
    assert!(!connector.is_alive());
    assert!(a.is_destroyed() && b.is_destroyed());
    assert_eq!(a.status(), Status::CLOSED);
    assert_eq!(provider.active_monitors("A"), 0);
    assert!(matches!(
        connector.new_connection("A", DataType::Long),
        Err(Error::LifecycleViolation(_))
    ));
    assert!(matches!(
        connector.get_value("A", DataType::Long),
        Err(Error::LifecycleViolation(_))
    ));
}

#[test]
fn scheduled_tasks_repeat_until_cancelled() {
    let provider = MemoryProvider::new();
    let connector = connector_with(&provider, config());
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let task = connector
        .schedule(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(10),
            Some(Duration::from_millis(10)),
        )
        .unwrap();
    thread::sleep(Duration::from_millis(200));
    task.cancel();
    assert!(count.load(Ordering::SeqCst) >= 2);
}

#[test]
fn foreign_responses_are_rejected() {
    let provider = MemoryProvider::new();
    provider.add_pv("MINE", 1i32).unwrap();
    provider.add_pv("THEIRS", 1i32).unwrap();
    let connector = connector_with(&provider, config());
    let mine = connector.new_connection("MINE", DataType::Long).unwrap();
    let theirs = connector.new_connection("THEIRS", DataType::Long).unwrap();
    let request = Request::new(&mine, RequestKind::Get, 2, None);
    assert!(matches!(
        request.add_response(Response::success(&theirs, None, None)),
        Err(Error::ForeignResponse { .. })
    ));
    assert!(request.responses().is_empty());
    request
        .add_response(Response::success(&mine, None, None))
        .unwrap();
    assert!(request.is_completed());
}

#[test]
fn completion_reflects_only_the_latest_response() {
    let provider = MemoryProvider::new();
    let connector = connector_with(&provider, config());
    let connection = connector.new_connection("ANY", DataType::Long).unwrap();
    let request = Request::new(&connection, RequestKind::Set, 3, None);
    request
        .add_response(Response::success(&connection, None, Some(Value::Long(1))))
        .unwrap();
    assert!(request.is_completed());
    request
        .add_response(
            Response::success(&connection, None, Some(Value::Long(2))).with_last(false),
        )
        .unwrap();
    assert!(!request.is_completed());
    assert!(request.wait_until_done_for(Duration::from_millis(20)).is_none());

    let waiter = {
        let request = request.clone();
        thread::spawn(move || request.wait_until_done())
    };
    thread::sleep(Duration::from_millis(20));
    request
        .add_response(Response::failure(
            &connection,
            Error::RemoteOperation {
                name: "ANY".into(),
                reason: "rejected".into(),
            },
            Some(Value::Long(3)),
        ))
        .unwrap();
    let done = waiter.join().unwrap();
    assert!(done.is_last() && !done.is_success());
    assert_eq!(done.tag(), Some(&Value::Long(3)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn retention_keeps_the_most_recent(capacity in 1usize..6, count in 1usize..20) {
        let provider = MemoryProvider::new();
        let connector = connector_with(&provider, config());
        let connection = connector.new_connection("RETAIN", DataType::Long).unwrap();
        let request = Request::new(&connection, RequestKind::Get, capacity, None);
        for i in 0..count {
            let response = Response::success(&connection, None, Some(Value::Long(i as i64)))
                .with_last(i + 1 == count);
            request.add_response(response).unwrap();
        }
        let retained = request.responses();
        prop_assert_eq!(retained.len(), count.min(capacity));
        let last = request.last_response().unwrap();
        prop_assert_eq!(last.tag(), Some(&Value::Long(count as i64 - 1)));
        let first = request.first_response().unwrap();
        prop_assert_eq!(first.tag(), Some(&Value::Long(count.saturating_sub(capacity) as i64)));
        prop_assert!(request.is_completed());
    }
}
