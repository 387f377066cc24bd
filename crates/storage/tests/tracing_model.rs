use nr_core::geom::Point3;
use nr_core::model::{Role, UNSET_RADIUS};
use nr_core::state::StateDescriptor;
use nr_storage::{
    AddNodeTagRequest, CreateTreenodeRequest, DeleteTreenodeRequest, MarkReviewedRequest,
    RemoveNodeTagRequest, ReparentTreenodeRequest, SqliteStore, StoreError,
    UpdateConfidenceRequest, UpdateRadiusRequest,
};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

const USER: i64 = 7;

fn temp_storage_dir(label: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic enough for tests")
        .as_nanos();
    path.push(format!("nr-model-{label}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&path).expect("temp storage dir must be creatable");
    path
}

fn open_project(label: &str) -> (SqliteStore, i64) {
    let dir = temp_storage_dir(label);
    let mut store = SqliteStore::open(&dir).expect("fresh storage should open");
    let project = store
        .create_project("optic lobe")
        .expect("project should be created");
    store
        .grant_project_role(project, USER, Role::Annotate)
        .expect("role should be granted");
    (store, project)
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

#[test]
fn root_and_child_form_one_skeleton() {
    let (mut store, project) = open_project("root-child");
    let root = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let child = create_node(&mut store, project, Some(root), Point3::new(3.0, 4.0, 0.0));

    let root_row = store.treenode(project, root).expect("root should exist");
    let child_row = store.treenode(project, child).expect("child should exist");
    assert_eq!(root_row.parent_id, None);
    assert_eq!(child_row.parent_id, Some(root));
    assert_eq!(root_row.skeleton_id, child_row.skeleton_id);

    let summary = store
        .skeleton_summary(project, root_row.skeleton_id)
        .expect("summary should exist");
    assert_eq!(summary.node_count, 2);
    assert!((summary.cable_length - 5.0).abs() < 1e-9);
}

#[test]
fn two_roots_get_distinct_skeletons() {
    let (mut store, project) = open_project("two-roots");
    let a = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let b = create_node(&mut store, project, None, Point3::new(10.0, 0.0, 0.0));
    let a_row = store.treenode(project, a).expect("first root");
    let b_row = store.treenode(project, b).expect("second root");
    assert_ne!(a_row.skeleton_id, b_row.skeleton_id);
}

#[test]
fn delete_relinks_children_to_grandparent() {
    let (mut store, project) = open_project("delete-relink");
    let a = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let b = create_node(&mut store, project, Some(a), Point3::new(3.0, 4.0, 0.0));
    let c = create_node(&mut store, project, Some(b), Point3::new(3.0, 4.0, 12.0));

    store
        .delete_treenode(DeleteTreenodeRequest {
            project_id: project,
            user_id: USER,
            node_id: b,
            state: StateDescriptor::Bypass,
        })
        .expect("middle node should be deletable");

    let c_row = store.treenode(project, c).expect("grandchild survives");
    assert_eq!(c_row.parent_id, Some(a));
    assert!(matches!(
        store.treenode(project, b),
        Err(StoreError::UnknownNode { .. })
    ));

    let summary = store
        .skeleton_summary(project, c_row.skeleton_id)
        .expect("summary survives");
    assert_eq!(summary.node_count, 2);
    // The two short edges collapse into the direct A-C edge.
    let direct = Point3::new(0.0, 0.0, 0.0).distance(Point3::new(3.0, 4.0, 12.0));
    assert!((summary.cable_length - direct).abs() < 1e-9);
}

#[test]
fn deleting_last_node_removes_the_summary() {
    let (mut store, project) = open_project("delete-last");
    let root = create_node(&mut store, project, None, Point3::new(1.0, 1.0, 1.0));
    let skeleton = store.treenode(project, root).expect("root").skeleton_id;
    store
        .delete_treenode(DeleteTreenodeRequest {
            project_id: project,
            user_id: USER,
            node_id: root,
            state: StateDescriptor::Bypass,
        })
        .expect("lone root should be deletable");
    assert!(matches!(
        store.skeleton_summary(project, skeleton),
        Err(StoreError::UnknownSkeleton { .. })
    ));
}

#[test]
fn deleting_root_with_multiple_children_is_rejected() {
    let (mut store, project) = open_project("delete-root-fork");
    let root = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    create_node(&mut store, project, Some(root), Point3::new(1.0, 0.0, 0.0));
    create_node(&mut store, project, Some(root), Point3::new(0.0, 1.0, 0.0));

    let err = store
        .delete_treenode(DeleteTreenodeRequest {
            project_id: project,
            user_id: USER,
            node_id: root,
            state: StateDescriptor::Bypass,
        })
        .expect_err("forked root must not be deletable in place");
    assert!(matches!(err, StoreError::StructuralViolation { .. }));
}

#[test]
fn deleting_root_with_single_child_promotes_the_child() {
    let (mut store, project) = open_project("delete-root-chain");
    let root = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let child = create_node(&mut store, project, Some(root), Point3::new(3.0, 4.0, 0.0));

    store
        .delete_treenode(DeleteTreenodeRequest {
            project_id: project,
            user_id: USER,
            node_id: root,
            state: StateDescriptor::Bypass,
        })
        .expect("root with one child should be deletable");
    let child_row = store.treenode(project, child).expect("child survives");
    assert_eq!(child_row.parent_id, None);

    let summary = store
        .skeleton_summary(project, child_row.skeleton_id)
        .expect("summary survives");
    assert_eq!(summary.node_count, 1);
    assert!(summary.cable_length.abs() < 1e-9);
}

#[test]
fn reparent_rejects_descendants_and_other_skeletons() {
    let (mut store, project) = open_project("reparent-guards");
    let a = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let b = create_node(&mut store, project, Some(a), Point3::new(1.0, 0.0, 0.0));
    let c = create_node(&mut store, project, Some(b), Point3::new(2.0, 0.0, 0.0));
    let other = create_node(&mut store, project, None, Point3::new(50.0, 0.0, 0.0));

    let err = store
        .reparent_treenode(ReparentTreenodeRequest {
            project_id: project,
            user_id: USER,
            node_id: a,
            new_parent_id: c,
            state: StateDescriptor::Bypass,
        })
        .expect_err("reparenting under a descendant must fail");
    assert!(matches!(err, StoreError::StructuralViolation { .. }));

    let err = store
        .reparent_treenode(ReparentTreenodeRequest {
            project_id: project,
            user_id: USER,
            node_id: c,
            new_parent_id: other,
            state: StateDescriptor::Bypass,
        })
        .expect_err("cross-skeleton reparent must go through join");
    assert!(matches!(err, StoreError::StructuralViolation { .. }));

    // A legal reparent within the skeleton.
    store
        .reparent_treenode(ReparentTreenodeRequest {
            project_id: project,
            user_id: USER,
            node_id: c,
            new_parent_id: a,
            state: StateDescriptor::Bypass,
        })
        .expect("moving a leaf under the root is legal");
    assert_eq!(
        store.treenode(project, c).expect("leaf").parent_id,
        Some(a)
    );
}

#[test]
fn radius_and_confidence_are_validated() {
    let (mut store, project) = open_project("radius-confidence");
    let root = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));

    let err = store
        .update_confidence(UpdateConfidenceRequest {
            project_id: project,
            user_id: USER,
            node_id: root,
            confidence: 9,
            state: StateDescriptor::Bypass,
        })
        .expect_err("confidence above 5 must be rejected");
    assert!(matches!(err, StoreError::InvalidInput(_)));

    let err = store
        .update_radius(UpdateRadiusRequest {
            project_id: project,
            user_id: USER,
            node_id: root,
            radius: -2.5,
            state: StateDescriptor::Bypass,
        })
        .expect_err("negative radius other than the sentinel must be rejected");
    assert!(matches!(err, StoreError::InvalidInput(_)));

    store
        .update_radius(UpdateRadiusRequest {
            project_id: project,
            user_id: USER,
            node_id: root,
            radius: 42.0,
            state: StateDescriptor::Bypass,
        })
        .expect("a measured radius should be accepted");
    let row = store.treenode(project, root).expect("root");
    assert!((row.radius - 42.0).abs() < 1e-9);
}

#[test]
fn tags_are_idempotent_and_sorted() {
    let (mut store, project) = open_project("tags");
    let root = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));

    let request = AddNodeTagRequest {
        project_id: project,
        user_id: USER,
        node_id: root,
        tag: "soma".to_string(),
    };
    assert!(store.add_node_tag(request.clone()).expect("first add"));
    assert!(!store.add_node_tag(request).expect("second add is a no-op"));
    store
        .add_node_tag(AddNodeTagRequest {
            project_id: project,
            user_id: USER,
            node_id: root,
            tag: "ends".to_string(),
        })
        .expect("second tag");

    assert_eq!(
        store.node_tags(project, root).expect("tags"),
        vec!["ends".to_string(), "soma".to_string()]
    );

    assert!(store
        .remove_node_tag(RemoveNodeTagRequest {
            project_id: project,
            user_id: USER,
            node_id: root,
            tag: "soma".to_string(),
        })
        .expect("removal"));
    assert_eq!(store.node_tags(project, root).expect("tags"), vec!["ends"]);
}

#[test]
fn review_does_not_bump_the_edition_stamp() {
    let (mut store, project) = open_project("review");
    let root = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let before = store.treenode(project, root).expect("root").edition_time_ms;

    store
        .mark_reviewed(MarkReviewedRequest {
            project_id: project,
            reviewer_id: USER,
            node_id: root,
        })
        .expect("review should succeed");
    let after = store.treenode(project, root).expect("root").edition_time_ms;
    assert_eq!(before, after);
}
