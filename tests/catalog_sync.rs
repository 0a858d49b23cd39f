use aedb_proxy::catalog::DdlOperation;
use aedb_proxy::catalog::schema::{ColumnDef, TableAlteration};
use aedb_proxy::catalog::types::{ColumnType, Row, Value};
use aedb_proxy::{CatalogCacheCoordinator, DataType, LoopbackEngine, ProxyConfig, Session};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

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
            (1..=3)
                .map(|id| Row::from_values(vec![Value::from(id), Value::from("open")]))
                .collect(),
        )
        .expect("rows");
    engine
}

fn coordinator(engine: &Arc<LoopbackEngine>) -> Arc<CatalogCacheCoordinator> {
    Arc::new(CatalogCacheCoordinator::new(
        engine.clone(),
        &ProxyConfig::default(),
    ))
}

fn column_names(data_type: &DataType) -> Vec<String> {
    data_type
        .table()
        .expect("table result")
        .columns
        .iter()
        .map(|c| c.name.clone())
        .collect()
}

#[test]
fn prepare_mirrors_the_table_it_reads() {
    let engine = server();
    let session = Session::open(coordinator(&engine), "desktop", ProxyConfig::default())
        .expect("session");
    let cache = session.client_cache().clone();
    assert!(cache.catalog(LOCK_TIMEOUT).expect("catalog").table("Orders").is_none());

    let plan = session.prepare("select Orders", &[]).expect("prepare");
    assert_eq!(column_names(plan.data_type().expect("data type")), ["id", "status"]);
    assert!(cache.catalog(LOCK_TIMEOUT).expect("catalog").table("Orders").is_some());

    let stats = cache.stats();
    assert_eq!(stats.client_timestamp, engine.issued_timestamp("desktop"));
    assert_eq!(stats.server_timestamp, engine.generation());
    assert_eq!(stats.wipes, 1);
    assert_eq!(stats.deltas_applied, 1);
    assert_eq!(engine.stats().describe_calls, 0);
}

#[test]
fn server_ddl_wipes_and_reships_definitions() {
    let engine = server();
    let session = Session::open(coordinator(&engine), "desktop", ProxyConfig::default())
        .expect("session");
    let cache = session.client_cache().clone();
    let plan = session.prepare("select Orders", &[]).expect("prepare");
    assert!(session.release(plan));

    engine
        .execute_ddl(DdlOperation::AlterTable {
            table_name: "Orders".into(),
            alteration: TableAlteration::AddColumn(
                ColumnDef::new("note", ColumnType::Text, true).with_default(Value::from("-")),
            ),
        })
        .expect("alter");

    let count = session.prepare("count Orders", &[]).expect("prepare");
    assert_eq!(cache.stats().wipes, 2);
    assert!(cache.catalog(LOCK_TIMEOUT).expect("catalog").table("Orders").is_none());
    assert_eq!(count.data_type().expect("data type"), &DataType::Scalar(ColumnType::Integer));
    session.release(count);

    let plan = session.prepare("select Orders", &[]).expect("prepare");
    assert_eq!(session.plan_cache_stats().discards, 1);
    assert_eq!(
        column_names(plan.data_type().expect("data type")),
        ["id", "status", "note"]
    );

    let mut cursor = session.open_cursor(&plan, &[]).expect("cursor");
    assert!(cursor.next().expect("next"));
    let row = cursor.select().expect("select");
    assert_eq!(row.values[2], Value::from("-"));
    assert_eq!(engine.stats().prepares, 3);
}

#[test]
fn concurrent_sessions_share_one_consistent_mirror() {
    let engine = server();
    let coordinator = coordinator(&engine);
    let holder = Session::open(coordinator.clone(), "desktop", ProxyConfig::default())
        .expect("session");

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let coordinator = coordinator.clone();
            thread::spawn(move || {
                let config = ProxyConfig::default().with_plan_cache_size(0);
                let session = Session::open(coordinator, "desktop", config).expect("session");
                for round in 0..10 {
                    let statement = if (worker + round) % 2 == 0 {
                        "select Orders"
                    } else {
                        "count Orders"
                    };
                    let plan = session.prepare(statement, &[]).expect("prepare");
                    plan.data_type().expect("data type");
                    session.release(plan);
                }
                session.close();
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    let cache = holder.client_cache();
    assert_eq!(cache.client_timestamp(), engine.issued_timestamp("desktop"));
    assert_eq!(cache.client_timestamp(), 40);
    assert_eq!(cache.pending_waits(), 0);
    assert_eq!(cache.session_count(), 1);
    assert_eq!(cache.stats().serialization_failures, 0);
    assert!(cache.catalog(LOCK_TIMEOUT).expect("catalog").table("Orders").is_some());
    assert_eq!(engine.open_plans(), 0);
}

#[test]
fn cache_is_destroyed_with_its_last_session() {
    let engine = server();
    let coordinator = coordinator(&engine);
    let first = Session::open(coordinator.clone(), "desktop", ProxyConfig::default())
        .expect("session");
    let plan = first.prepare("select Orders", &[]).expect("prepare");
    first.release(plan);
    first.close();
    assert!(coordinator.cache("desktop").is_none());
    assert_eq!(engine.issued_timestamp("desktop"), 0);

    let second = Session::open(coordinator.clone(), "desktop", ProxyConfig::default())
        .expect("session");
    let plan = second.prepare("select Orders", &[]).expect("prepare");
    assert_eq!(column_names(plan.data_type().expect("data type")), ["id", "status"]);
    assert_eq!(second.client_cache().client_timestamp(), 1);
}

#[test]
fn named_caches_are_independent() {
    let engine = server();
    let coordinator = coordinator(&engine);
    let desktop = Session::open(coordinator.clone(), "desktop", ProxyConfig::default())
        .expect("session");
    let laptop = Session::open(coordinator.clone(), "laptop", ProxyConfig::default())
        .expect("session");
    assert_eq!(coordinator.cache_names(), ["desktop", "laptop"]);

    desktop.prepare("select Orders", &[]).expect("prepare");
    assert_eq!(desktop.client_cache().client_timestamp(), 1);
    assert_eq!(laptop.client_cache().client_timestamp(), 0);
    assert!(
        laptop
            .client_cache()
            .catalog(LOCK_TIMEOUT)
            .expect("catalog")
            .table("Orders")
            .is_none()
    );
}
