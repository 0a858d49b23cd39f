use aedb_proxy::catalog::schema::ColumnDef;
use aedb_proxy::catalog::types::{ColumnType, Row, Value};
use aedb_proxy::session::RemoteResource;
use aedb_proxy::{CatalogCacheCoordinator, LoopbackEngine, ProxyConfig, ProxyErrorCode, Session};
use std::sync::Arc;

fn server() -> Arc<LoopbackEngine> {
    let engine = Arc::new(LoopbackEngine::new());
    engine.create_library("Sales").expect("library");
    engine
        .create_table(
            "Sales",
            "Orders",
            vec![
                ColumnDef::new("id", ColumnType::Integer, false),
                ColumnDef::new("status", ColumnType::Text, true),
            ],
            &["id"],
        )
        .expect("table");
    engine
        .insert_rows(
            "Orders",
            (1..=30i64)
                .map(|id| Row::from_values(vec![Value::from(id), Value::Null]))
                .collect(),
        )
        .expect("rows");
    engine
}

fn open(engine: &Arc<LoopbackEngine>) -> (Arc<CatalogCacheCoordinator>, Session) {
    let config = ProxyConfig::default().with_window_size(8);
    let coordinator = Arc::new(CatalogCacheCoordinator::new(engine.clone(), &config));
    let session = Session::open(coordinator.clone(), "desktop", config).expect("session");
    (coordinator, session)
}

#[test]
fn close_releases_everything_still_outstanding() {
    let engine = server();
    let (coordinator, session) = open(&engine);
    let held = session.prepare("select Orders", &[]).expect("prepare");
    let mut cursor = session.open_cursor(&held, &[]).expect("cursor");
    cursor.next().expect("next");
    cursor.get_bookmark().expect("bookmark");
    let cached = session.prepare("count Orders", &[]).expect("prepare");
    session.release(cached);

    let outstanding = session.outstanding_resources();
    assert_eq!(outstanding.len(), 3);
    assert_eq!(
        outstanding[0].resource,
        RemoteResource::Cursor(cursor.handle())
    );

    session.close();
    assert!(coordinator.cache("desktop").is_none());
    let stats = engine.stats();
    assert_eq!(engine.open_plans(), 0);
    assert_eq!(engine.open_cursors(), 0);
    assert_eq!(engine.live_bookmarks(), 0);
    assert_eq!(stats.unprepares, 2);
    assert_eq!(stats.cursors_closed, 1);

    drop(cursor);
    drop(held);
    let after = engine.stats();
    assert_eq!(after.unprepares, 2);
    assert_eq!(after.cursors_closed, 1);
    assert_eq!(after.dispose_calls, stats.dispose_calls);
}

#[test]
fn dropping_a_session_closes_it() {
    let engine = server();
    let (coordinator, session) = open(&engine);
    let plan = session.prepare("select Orders", &[]).expect("prepare");
    let _cursor = session.open_cursor(&plan, &[]).expect("cursor");
    drop(session);
    assert!(coordinator.cache_names().is_empty());
    assert_eq!(engine.open_plans(), 0);
    assert_eq!(engine.open_cursors(), 0);
}

#[test]
fn released_handles_leave_the_outstanding_list() {
    let engine = server();
    let (_coordinator, session) = open(&engine);
    let plan = session.prepare("select Orders", &[]).expect("prepare");
    let cursor = session.open_cursor(&plan, &[]).expect("cursor");
    assert_eq!(session.outstanding_resources().len(), 2);

    cursor.close().expect("close");
    assert_eq!(
        session
            .outstanding_resources()
            .iter()
            .map(|r| r.resource)
            .collect::<Vec<_>>(),
        vec![RemoteResource::Plan(plan.handle())]
    );
    drop(plan);
    assert!(session.outstanding_resources().is_empty());
    assert_eq!(engine.open_plans(), 0);
}

#[test]
fn failed_prepare_leaves_nothing_behind() {
    let engine = server();
    let (_coordinator, session) = open(&engine);
    let err = session.prepare("drop Orders", &[]).err().expect("unsupported");
    assert_eq!(err.code(), ProxyErrorCode::Validation);
    let err = session.prepare("select Missing", &[]).err().expect("missing");
    assert_eq!(err.code(), ProxyErrorCode::TableNotFound);

    assert!(session.outstanding_resources().is_empty());
    assert_eq!(engine.open_plans(), 0);
    assert_eq!(session.client_cache().client_timestamp(), 0);
}

#[test]
fn invalid_config_never_attaches() {
    let engine = server();
    let config = ProxyConfig::default().with_window_size(0);
    let coordinator = Arc::new(CatalogCacheCoordinator::new(engine.clone(), &config));
    let err = Session::open(coordinator.clone(), "desktop", config)
        .err()
        .expect("rejected");
    assert_eq!(err.code(), ProxyErrorCode::InvalidConfig);
    assert!(coordinator.cache_names().is_empty());
}

#[test]
fn sessions_get_distinct_ids_on_one_cache() {
    let engine = server();
    let (coordinator, first) = open(&engine);
    let second = Session::open(coordinator.clone(), "desktop", ProxyConfig::default())
        .expect("session");
    assert_ne!(first.id(), second.id());
    assert!(Arc::ptr_eq(first.client_cache(), second.client_cache()));
    assert_eq!(first.client_cache().session_count(), 2);

    first.close();
    assert_eq!(coordinator.cache_names(), ["desktop"]);
    second.close();
    assert!(coordinator.cache_names().is_empty());
}
