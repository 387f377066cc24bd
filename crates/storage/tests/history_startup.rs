use nr_core::geom::Point3;
use nr_core::model::{Role, UNSET_RADIUS};
use nr_core::state::StateDescriptor;
use nr_storage::{
    CreateTreenodeRequest, DeleteTreenodeRequest, MoveTreenodeRequest, SqliteStore, StoreError,
};
use rusqlite::Connection;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

const USER: i64 = 13;

fn temp_storage_dir(label: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic enough for tests")
        .as_nanos();
    path.push(format!("nr-history-{label}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&path).expect("temp storage dir must be creatable");
    path
}

fn open_project(label: &str) -> (SqliteStore, i64, PathBuf) {
    let dir = temp_storage_dir(label);
    let mut store = SqliteStore::open(&dir).expect("fresh storage should open");
    let project = store
        .create_project("medulla")
        .expect("project should be created");
    store
        .grant_project_role(project, USER, Role::Annotate)
        .expect("role should be granted");
    (store, project, dir)
}

fn create_node(
    store: &mut SqliteStore,
    project: i64,
    parent: Option<i64>,
    location: Point3,
) -> i64 {
    store
        .create_treenode(CreateTreenodeRequest {
            project_id: project,
            user_id: USER,
            parent_id: parent,
            location,
            radius: UNSET_RADIUS,
            confidence: 5,
            state: StateDescriptor::Bypass,
        })
        .expect("node should be created")
}

fn move_to(store: &mut SqliteStore, project: i64, node: i64, location: Point3) {
    store
        .move_treenode(MoveTreenodeRequest {
            project_id: project,
            user_id: USER,
            node_id: node,
            location,
            state: StateDescriptor::Bypass,
        })
        .expect("move should succeed");
}

#[test]
fn history_toggle_is_idempotent() {
    let (mut store, _, _) = open_project("toggle");
    assert!(!store.history_enabled().expect("flag readable"));
    assert!(store.enable_history_tracking().expect("first enable"));
    assert!(!store.enable_history_tracking().expect("second enable"));
    assert!(store.history_enabled().expect("flag readable"));
    assert!(store.disable_history_tracking().expect("disable"));
    assert!(!store.history_enabled().expect("flag readable"));
}

#[test]
fn edits_write_shadow_versions_when_tracking_is_on() {
    let (mut store, project, _) = open_project("shadows");
    store.enable_history_tracking().expect("enable");
    let node = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    move_to(&mut store, project, node, Point3::new(1.0, 0.0, 0.0));
    move_to(&mut store, project, node, Point3::new(2.0, 0.0, 0.0));

    let versions = store.node_history(project, node).expect("history");
    assert_eq!(versions.len(), 3);
    assert!((versions[0].x - 0.0).abs() < 1e-9);
    assert!((versions[1].x - 1.0).abs() < 1e-9);
    assert!((versions[2].x - 2.0).abs() < 1e-9);
    // Past versions are closed intervals, the live row is open-ended.
    assert!(versions[0].valid_to_ms < i64::MAX);
    assert!(versions[1].valid_to_ms < i64::MAX);
    assert_eq!(versions[2].valid_to_ms, i64::MAX);
    assert!(versions[0].valid_from_ms <= versions[0].valid_to_ms);
}

#[test]
fn no_shadow_versions_accumulate_while_tracking_is_off() {
    let (mut store, project, _) = open_project("no-shadows");
    let node = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    move_to(&mut store, project, node, Point3::new(1.0, 0.0, 0.0));
    move_to(&mut store, project, node, Point3::new(2.0, 0.0, 0.0));

    let versions = store.node_history(project, node).expect("history");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].valid_to_ms, i64::MAX);
    assert!((versions[0].x - 2.0).abs() < 1e-9);
}

#[test]
fn deleted_nodes_keep_their_history() {
    let (mut store, project, _) = open_project("deleted");
    store.enable_history_tracking().expect("enable");
    let node = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    move_to(&mut store, project, node, Point3::new(5.0, 0.0, 0.0));
    store
        .delete_treenode(DeleteTreenodeRequest {
            project_id: project,
            user_id: USER,
            node_id: node,
            state: StateDescriptor::Bypass,
        })
        .expect("delete should succeed");

    assert!(matches!(
        store.treenode(project, node),
        Err(StoreError::UnknownNode { .. })
    ));
    let versions = store.node_history(project, node).expect("history survives");
    assert_eq!(versions.len(), 2);
    assert!(versions.iter().all(|v| v.valid_to_ms < i64::MAX));
}

#[test]
fn truncate_history_drops_closed_versions() {
    let (mut store, project, _) = open_project("truncate");
    store.enable_history_tracking().expect("enable");
    let node = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    move_to(&mut store, project, node, Point3::new(1.0, 0.0, 0.0));
    move_to(&mut store, project, node, Point3::new(2.0, 0.0, 0.0));

    let removed = store
        .truncate_history(i64::MAX)
        .expect("truncation should succeed");
    assert_eq!(removed, 2);

    let versions = store.node_history(project, node).expect("history");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].valid_to_ms, i64::MAX);
}

#[test]
fn startup_check_repairs_flags_and_counters() {
    let (mut store, project, dir) = open_project("repairs");
    create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    drop(store);

    {
        let conn =
            Connection::open(dir.join("neurite.db")).expect("direct connection should open");
        conn.execute(
            "UPDATE meta SET value='maybe' WHERE key='history_tracking'",
            [],
        )
        .expect("flag tampering");
        conn.execute("DELETE FROM counters WHERE name='txid'", [])
            .expect("counter tampering");
        conn.execute("UPDATE counters SET value=0 WHERE name='skeleton'", [])
            .expect("counter rollback");
    }

    let mut store = SqliteStore::open(&dir).expect("reopen");
    let report = store.startup_check().expect("check should run");
    assert!(!report.is_clean());
    assert_eq!(report.repairs.len(), 3);
    assert!(report.warnings.is_empty());
    assert!(!store.history_enabled().expect("flag reset to off"));

    let again = store.startup_check().expect("second check");
    assert!(again.is_clean());
}

#[test]
fn preflight_refuses_foreign_and_outdated_databases() {
    // A database with tables but no meta table is not ours.
    let dir = temp_storage_dir("foreign");
    {
        let conn =
            Connection::open(dir.join("neurite.db")).expect("direct connection should open");
        conn.execute("CREATE TABLE shapes (id INTEGER PRIMARY KEY)", [])
            .expect("foreign table");
    }
    let err = SqliteStore::open(&dir).expect_err("foreign database must be refused");
    assert!(matches!(
        err,
        StoreError::InvalidInput(m) if m.contains("RESET_REQUIRED")
    ));

    // A meta table carrying a different schema version fails closed too.
    let (store, _, dir) = open_project("outdated");
    drop(store);
    {
        let conn =
            Connection::open(dir.join("neurite.db")).expect("direct connection should open");
        conn.execute("UPDATE meta SET value='v0' WHERE key='schema_version'", [])
            .expect("version tampering");
    }
    let err = SqliteStore::open(&dir).expect_err("outdated database must be refused");
    assert!(matches!(
        err,
        StoreError::InvalidInput(m) if m.contains("RESET_REQUIRED")
    ));
}
