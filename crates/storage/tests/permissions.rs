use nr_core::geom::Point3;
use nr_core::model::{Role, UNSET_RADIUS};
use nr_core::state::StateDescriptor;
use nr_storage::{
    CreateTreenodeRequest, ListNodesRequest, SqliteStore, StoreError, TruncationPolicy,
};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

const OWNER: i64 = 2;
const VISITOR: i64 = 9;

fn temp_storage_dir(label: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic enough for tests")
        .as_nanos();
    path.push(format!("nr-perm-{label}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&path).expect("temp storage dir must be creatable");
    path
}

fn open_project(label: &str) -> (SqliteStore, i64) {
    let dir = temp_storage_dir(label);
    let mut store = SqliteStore::open(&dir).expect("fresh storage should open");
    let project = store
        .create_project("antennal lobe")
        .expect("project should be created");
    store
        .grant_project_role(project, OWNER, Role::Annotate)
        .expect("role should be granted");
    (store, project)
}

fn create_request(project: i64, user: i64) -> CreateTreenodeRequest {
    CreateTreenodeRequest {
        project_id: project,
        user_id: user,
        parent_id: None,
        location: Point3::new(0.0, 0.0, 0.0),
        radius: UNSET_RADIUS,
        confidence: 5,
        state: StateDescriptor::Bypass,
    }
}

fn list_request(project: i64, user: i64) -> ListNodesRequest {
    ListNodesRequest {
        project_id: project,
        user_id: user,
        min: Point3::new(-10.0, -10.0, -10.0),
        max: Point3::new(10.0, 10.0, 10.0),
        limit: None,
        policy: TruncationPolicy::default(),
        lod_level: None,
        grid_id: None,
    }
}

#[test]
fn unknown_projects_are_reported_before_roles() {
    let (mut store, _) = open_project("unknown-project");
    let err = store
        .grant_project_role(999, OWNER, Role::Browse)
        .expect_err("grants need an existing project");
    assert!(matches!(err, StoreError::UnknownProject { .. }));

    let err = store
        .create_treenode(create_request(999, OWNER))
        .expect_err("mutations need an existing project");
    assert!(matches!(err, StoreError::UnknownProject { .. }));
}

#[test]
fn users_without_a_role_are_denied() {
    let (mut store, project) = open_project("no-role");
    let err = store
        .create_treenode(create_request(project, VISITOR))
        .expect_err("unlisted users cannot mutate");
    assert!(matches!(err, StoreError::PermissionDenied { .. }));
    let err = store
        .list_nodes(list_request(project, VISITOR))
        .expect_err("unlisted users cannot read either");
    assert!(matches!(err, StoreError::PermissionDenied { .. }));
}

#[test]
fn browse_reads_but_does_not_mutate() {
    let (mut store, project) = open_project("browse");
    store
        .create_treenode(create_request(project, OWNER))
        .expect("seed node");
    store
        .grant_project_role(project, VISITOR, Role::Browse)
        .expect("browse grant");

    let result = store
        .list_nodes(list_request(project, VISITOR))
        .expect("browsers can query");
    assert_eq!(result.treenodes.len(), 1);

    let err = store
        .create_treenode(create_request(project, VISITOR))
        .expect_err("browsers cannot create nodes");
    assert!(matches!(
        err,
        StoreError::PermissionDenied { required, .. } if required == "annotate"
    ));
}

#[test]
fn annotate_covers_browsing() {
    let (mut store, project) = open_project("annotate");
    store
        .create_treenode(create_request(project, OWNER))
        .expect("annotators can create");
    let result = store
        .list_nodes(list_request(project, OWNER))
        .expect("annotators can query");
    assert_eq!(result.treenodes.len(), 1);
}

#[test]
fn regrants_replace_the_role_and_revokes_remove_it() {
    let (mut store, project) = open_project("regrant");
    store
        .grant_project_role(project, VISITOR, Role::Browse)
        .expect("browse grant");
    let err = store
        .create_treenode(create_request(project, VISITOR))
        .expect_err("browse does not cover annotate");
    assert!(matches!(err, StoreError::PermissionDenied { .. }));

    store
        .grant_project_role(project, VISITOR, Role::Annotate)
        .expect("upgrade to annotate");
    store
        .create_treenode(create_request(project, VISITOR))
        .expect("upgraded users can mutate");

    assert!(store
        .revoke_project_role(project, VISITOR)
        .expect("revocation"));
    assert!(!store
        .revoke_project_role(project, VISITOR)
        .expect("second revocation is a no-op"));
    let err = store
        .list_nodes(list_request(project, VISITOR))
        .expect_err("revoked users lose access");
    assert!(matches!(err, StoreError::PermissionDenied { .. }));
}
