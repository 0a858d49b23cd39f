use aedb_proxy::catalog::schema::ColumnDef;
use aedb_proxy::catalog::types::ColumnType;
use aedb_proxy::{
    CatalogCacheCoordinator, LoopbackEngine, Param, ProxyConfig, ProxyErrorCode, RemoteEngine,
    Session,
};
use std::sync::Arc;

fn server() -> Arc<LoopbackEngine> {
    let engine = Arc::new(LoopbackEngine::new());
    engine.create_library("Sales").expect("library");
    for table in ["Orders", "Customers"] {
        engine
            .create_table(
                "Sales",
                table,
                vec![
                    ColumnDef::new("id", ColumnType::Integer, false),
                    ColumnDef::new("name", ColumnType::Text, true),
                ],
                &["id"],
            )
            .expect("table");
    }
    engine
}

fn session(engine: &Arc<LoopbackEngine>, config: ProxyConfig) -> Session {
    let coordinator = Arc::new(CatalogCacheCoordinator::new(engine.clone(), &config));
    Session::open(coordinator, "desktop", config).expect("session")
}

#[test]
fn released_plan_is_reused_without_server_prepare() {
    let engine = server();
    let session = session(&engine, ProxyConfig::default());
    let plan = session.prepare("select Orders", &[]).expect("prepare");
    let handle = plan.handle();
    assert!(session.release(plan));

    let again = session.prepare("select Orders", &[]).expect("prepare");
    assert_eq!(again.handle(), handle);
    assert_eq!(engine.stats().prepares, 1);
    let stats = session.plan_cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.cached, 0);
}

#[test]
fn checked_out_plans_are_never_shared() {
    let engine = server();
    let session = session(&engine, ProxyConfig::default());
    let first = session.prepare("select Orders", &[]).expect("prepare");
    let second = session.prepare("select Orders", &[]).expect("prepare");
    assert_ne!(first.handle(), second.handle());
    assert_eq!(engine.stats().prepares, 2);

    session.release(first);
    session.release(second);
    assert_eq!(session.plan_cache_stats().cached, 2);
    assert_eq!(engine.open_plans(), 2);
}

#[test]
fn catalog_wipe_discards_cached_plans() {
    let engine = server();
    let session = session(&engine, ProxyConfig::default());
    let plan = session.prepare("select Orders", &[]).expect("prepare");
    session.release(plan);

    engine
        .create_table(
            "Sales",
            "Invoices",
            vec![ColumnDef::new("id", ColumnType::Integer, false)],
            &["id"],
        )
        .expect("table");
    let other = session.prepare("select Customers", &[]).expect("prepare");
    assert_eq!(session.client_cache().stats().wipes, 2);

    let plan = session.prepare("select Orders", &[]).expect("prepare");
    assert_eq!(session.plan_cache_stats().discards, 1);
    assert_eq!(engine.stats().prepares, 3);
    assert_eq!(engine.stats().unprepares, 1);
    drop(plan);
    drop(other);
    assert_eq!(engine.open_plans(), 0);
}

#[test]
fn session_scoped_plans_are_not_cached() {
    let engine = server();
    engine.set_session_scoped("Orders", true);
    let session = session(&engine, ProxyConfig::default());
    let plan = session.prepare("select Orders", &[]).expect("prepare");
    assert!(!session.release(plan));
    assert_eq!(engine.stats().unprepares, 1);
    assert_eq!(engine.open_plans(), 0);
}

#[test]
fn cache_size_of_one_disables_caching() {
    let engine = server();
    let session = session(&engine, ProxyConfig::default().with_plan_cache_size(1));
    for _ in 0..3 {
        let plan = session.prepare("select Orders", &[]).expect("prepare");
        assert!(!session.release(plan));
    }
    assert_eq!(engine.stats().prepares, 3);
    assert_eq!(engine.stats().unprepares, 3);
}

#[test]
fn invalidated_plan_is_destroyed_on_release() {
    let engine = server();
    let session = session(&engine, ProxyConfig::default());
    let plan = session.prepare("select Orders", &[]).expect("prepare");
    plan.invalidate();
    assert!(!session.release(plan));
    assert_eq!(session.plan_cache_stats().discards, 1);
    assert_eq!(engine.open_plans(), 0);
}

#[test]
fn reused_plan_that_fails_is_not_cached_again() {
    let engine = server();
    let session = session(&engine, ProxyConfig::default());
    let plan = session.prepare("select Orders", &[]).expect("prepare");
    assert!(!plan.is_reused());
    let handle = plan.handle();
    assert!(session.release(plan));

    engine.unprepare(handle).expect("server unprepare");
    let plan = session.prepare("select Orders", &[]).expect("prepare");
    assert!(plan.is_reused());
    assert_eq!(plan.handle(), handle);
    let err = session.open_cursor(&plan, &[]).err().expect("server plan gone");
    assert_eq!(err.code(), ProxyErrorCode::PlanNotFound);

    assert!(!session.release(plan));
    assert_eq!(session.plan_cache_stats().discards, 1);
    assert_eq!(session.plan_cache_stats().cached, 0);
    let fresh = session.prepare("select Orders", &[]).expect("prepare");
    assert!(!fresh.is_reused());
    assert_ne!(fresh.handle(), handle);
    session.open_cursor(&fresh, &[]).expect("cursor");
    assert_eq!(engine.stats().prepares, 2);
}

#[test]
fn parameter_types_and_transaction_state_split_keys() {
    let engine = server();
    let mut session = session(&engine, ProxyConfig::default());
    let by_number = [Param::new("limit", 10)];
    let by_text = [Param::new("limit", "ten")];

    let plan = session.prepare("select Orders", &by_number).expect("prepare");
    session.release(plan);
    let plan = session.prepare("select Orders", &by_text).expect("prepare");
    session.release(plan);
    assert_eq!(engine.stats().prepares, 2);

    let plan = session
        .prepare("select Orders", &[Param::new("limit", 99)])
        .expect("prepare");
    session.release(plan);
    assert_eq!(engine.stats().prepares, 2);

    session.set_in_application_transaction(true);
    let plan = session.prepare("select Orders", &by_number).expect("prepare");
    session.release(plan);
    assert_eq!(engine.stats().prepares, 3);

    let plan = session
        .prepare_in("Sales", "select Orders", &by_number)
        .expect("prepare");
    session.release(plan);
    assert_eq!(engine.stats().prepares, 4);
}

#[test]
fn least_recently_released_plan_is_evicted() {
    let engine = server();
    let session = session(&engine, ProxyConfig::default().with_plan_cache_size(2));
    let orders_a = session.prepare("select Orders", &[]).expect("prepare");
    let orders_b = session.prepare("select Orders", &[]).expect("prepare");
    let customers = session.prepare("select Customers", &[]).expect("prepare");
    let newest_orders = orders_b.handle();

    session.release(orders_a);
    session.release(orders_b);
    session.release(customers);
    let stats = session.plan_cache_stats();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.cached, 2);
    assert_eq!(engine.open_plans(), 2);

    let plan = session.prepare("select Orders", &[]).expect("prepare");
    assert_eq!(plan.handle(), newest_orders);
    assert_eq!(engine.stats().prepares, 3);
}

#[test]
fn shrinking_the_cache_evicts() {
    let engine = server();
    let session = session(&engine, ProxyConfig::default());
    let orders = session.prepare("select Orders", &[]).expect("prepare");
    let customers = session.prepare("select Customers", &[]).expect("prepare");
    session.release(orders);
    session.release(customers);

    session.resize_plan_cache(1);
    assert_eq!(session.plan_cache_stats().cached, 0);
    assert_eq!(engine.open_plans(), 0);
}
