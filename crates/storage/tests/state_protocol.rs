use nr_core::geom::Point3;
use nr_core::model::{RelationKind, Role, UNSET_RADIUS};
use nr_core::state::{ElementStamp, ParentState, StateDescriptor};
use nr_storage::{
    AddLinkRequest, CreateConnectorRequest, CreateTreenodeRequest, DeleteTreenodeRequest,
    MoveConnectorRequest, MoveTreenodeRequest, SqliteStore, StoreError,
};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

const USER: i64 = 3;

fn temp_storage_dir(label: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic enough for tests")
        .as_nanos();
    path.push(format!("nr-state-{label}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&path).expect("temp storage dir must be creatable");
    path
}

fn open_project(label: &str) -> (SqliteStore, i64) {
    let dir = temp_storage_dir(label);
    let mut store = SqliteStore::open(&dir).expect("fresh storage should open");
    let project = store
        .create_project("medulla")
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

fn stamp_of(store: &SqliteStore, project: i64, node: i64) -> i64 {
    store
        .treenode(project, node)
        .expect("node should exist")
        .edition_time_ms
}

fn move_with(
    store: &mut SqliteStore,
    project: i64,
    node: i64,
    state: StateDescriptor,
) -> Result<(), StoreError> {
    store.move_treenode(MoveTreenodeRequest {
        project_id: project,
        user_id: USER,
        node_id: node,
        location: Point3::new(9.0, 9.0, 9.0),
        state,
    })
}

#[test]
fn exact_stamp_passes_and_stale_stamp_fails() {
    let (mut store, project) = open_project("node-stamp");
    let node = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let stamp = stamp_of(&store, project, node);

    move_with(
        &mut store,
        project,
        node,
        StateDescriptor::Node {
            edition_time_ms: stamp,
        },
    )
    .expect("a matching stamp must pass");

    let err = move_with(
        &mut store,
        project,
        node,
        StateDescriptor::Node {
            edition_time_ms: stamp,
        },
    )
    .expect_err("the consumed stamp must now be stale");
    assert!(matches!(
        err,
        StoreError::StaleState { node_id, .. } if node_id == node
    ));
}

#[test]
fn every_edit_bumps_the_stamp_even_within_one_millisecond() {
    let (mut store, project) = open_project("monotonic");
    let node = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let mut previous = stamp_of(&store, project, node);
    for _ in 0..5 {
        move_with(
            &mut store,
            project,
            node,
            StateDescriptor::Node {
                edition_time_ms: previous,
            },
        )
        .expect("move with the fresh stamp");
        let next = stamp_of(&store, project, node);
        assert!(next > previous, "stamps must be strictly increasing");
        previous = next;
    }
}

#[test]
fn root_claim_is_checked_against_live_rows() {
    let (mut store, project) = open_project("root-claim");
    let root = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let child = create_node(&mut store, project, Some(root), Point3::new(1.0, 0.0, 0.0));

    let child_stamp = stamp_of(&store, project, child);
    let err = move_with(
        &mut store,
        project,
        child,
        StateDescriptor::Neighborhood {
            edition_time_ms: child_stamp,
            parent: Some(ParentState::Root),
            children: None,
            links: None,
        },
    )
    .expect_err("a child claiming to be root must fail");
    assert!(matches!(err, StoreError::StaleState { .. }));

    let root_stamp = stamp_of(&store, project, root);
    move_with(
        &mut store,
        project,
        root,
        StateDescriptor::Neighborhood {
            edition_time_ms: root_stamp,
            parent: Some(ParentState::Root),
            children: None,
            links: None,
        },
    )
    .expect("the actual root's claim must pass");
}

#[test]
fn parent_claim_checks_identity_and_stamp() {
    let (mut store, project) = open_project("parent-claim");
    let root = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let child = create_node(&mut store, project, Some(root), Point3::new(1.0, 0.0, 0.0));
    let stranger = create_node(&mut store, project, None, Point3::new(50.0, 0.0, 0.0));

    let child_stamp = stamp_of(&store, project, child);
    let stranger_stamp = stamp_of(&store, project, stranger);
    let err = move_with(
        &mut store,
        project,
        child,
        StateDescriptor::Neighborhood {
            edition_time_ms: child_stamp,
            parent: Some(ParentState::Node(ElementStamp {
                id: stranger,
                edition_time_ms: stranger_stamp,
            })),
            children: None,
            links: None,
        },
    )
    .expect_err("claiming the wrong parent must fail");
    assert!(matches!(err, StoreError::StaleState { .. }));

    let child_stamp = stamp_of(&store, project, child);
    let root_stamp = stamp_of(&store, project, root);
    let err = move_with(
        &mut store,
        project,
        child,
        StateDescriptor::Neighborhood {
            edition_time_ms: child_stamp,
            parent: Some(ParentState::Node(ElementStamp {
                id: root,
                edition_time_ms: root_stamp - 1,
            })),
            children: None,
            links: None,
        },
    )
    .expect_err("a stale parent stamp must fail");
    assert!(matches!(
        err,
        StoreError::StaleState { node_id, .. } if node_id == root
    ));

    let child_stamp = stamp_of(&store, project, child);
    let root_stamp = stamp_of(&store, project, root);
    move_with(
        &mut store,
        project,
        child,
        StateDescriptor::Neighborhood {
            edition_time_ms: child_stamp,
            parent: Some(ParentState::Node(ElementStamp {
                id: root,
                edition_time_ms: root_stamp,
            })),
            children: None,
            links: None,
        },
    )
    .expect("the correct parent claim must pass");
}

#[test]
fn children_claim_is_an_exact_set() {
    let (mut store, project) = open_project("children-claim");
    let root = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let a = create_node(&mut store, project, Some(root), Point3::new(1.0, 0.0, 0.0));
    let b = create_node(&mut store, project, Some(root), Point3::new(0.0, 1.0, 0.0));

    let full_claim = |store: &SqliteStore| {
        vec![
            ElementStamp {
                id: a,
                edition_time_ms: stamp_of(store, project, a),
            },
            ElementStamp {
                id: b,
                edition_time_ms: stamp_of(store, project, b),
            },
        ]
    };

    // Missing one live child: the client does not know about b.
    let root_stamp = stamp_of(&store, project, root);
    let a_stamp = stamp_of(&store, project, a);
    let err = move_with(
        &mut store,
        project,
        root,
        StateDescriptor::Neighborhood {
            edition_time_ms: root_stamp,
            parent: Some(ParentState::Root),
            children: Some(vec![ElementStamp {
                id: a,
                edition_time_ms: a_stamp,
            }]),
            links: None,
        },
    )
    .expect_err("a live child missing from the claim must fail");
    assert!(matches!(err, StoreError::StaleState { .. }));

    // One of many children stale.
    let mut stale = full_claim(&store);
    stale[1].edition_time_ms -= 1;
    let root_stamp = stamp_of(&store, project, root);
    let err = move_with(
        &mut store,
        project,
        root,
        StateDescriptor::Neighborhood {
            edition_time_ms: root_stamp,
            parent: Some(ParentState::Root),
            children: Some(stale),
            links: None,
        },
    )
    .expect_err("one stale child among many must fail");
    assert!(matches!(err, StoreError::StaleState { .. }));

    let claim = full_claim(&store);
    let root_stamp = stamp_of(&store, project, root);
    move_with(
        &mut store,
        project,
        root,
        StateDescriptor::Neighborhood {
            edition_time_ms: root_stamp,
            parent: Some(ParentState::Root),
            children: Some(claim),
            links: None,
        },
    )
    .expect("the exact children set must pass");
}

#[test]
fn link_claim_is_an_exact_set() {
    let (mut store, project) = open_project("link-claim");
    let node = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let connector = store
        .create_connector(CreateConnectorRequest {
            project_id: project,
            user_id: USER,
            location: Point3::new(5.0, 0.0, 0.0),
            confidence: 5,
        })
        .expect("connector should be created");
    let link = store
        .add_link(AddLinkRequest {
            project_id: project,
            user_id: USER,
            treenode_id: node,
            connector_id: connector,
            relation: RelationKind::PresynapticTo,
            confidence: 5,
            treenode_state: StateDescriptor::Bypass,
            connector_state: StateDescriptor::Bypass,
        })
        .expect("link should be created");

    let node_stamp = stamp_of(&store, project, node);
    let err = move_with(
        &mut store,
        project,
        node,
        StateDescriptor::Neighborhood {
            edition_time_ms: node_stamp,
            parent: None,
            children: None,
            links: Some(vec![]),
        },
    )
    .expect_err("an unknown live link must fail the empty claim");
    assert!(matches!(err, StoreError::StaleState { .. }));

    let link_stamp = store
        .connector(project, connector)
        .expect("connector should exist")
        .links
        .iter()
        .find(|l| l.link_id == link)
        .expect("link should be listed")
        .edition_time_ms;
    let node_stamp = stamp_of(&store, project, node);
    move_with(
        &mut store,
        project,
        node,
        StateDescriptor::Neighborhood {
            edition_time_ms: node_stamp,
            parent: None,
            children: None,
            links: Some(vec![ElementStamp {
                id: link,
                edition_time_ms: link_stamp,
            }]),
        },
    )
    .expect("the exact link set must pass");
}

#[test]
fn multi_shape_checks_every_stamp() {
    let (mut store, project) = open_project("multi");
    let a = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let b = create_node(&mut store, project, Some(a), Point3::new(1.0, 0.0, 0.0));

    let err = store
        .delete_treenode(DeleteTreenodeRequest {
            project_id: project,
            user_id: USER,
            node_id: b,
            state: StateDescriptor::Multi(vec![
                ElementStamp {
                    id: a,
                    edition_time_ms: stamp_of(&store, project, a) - 1,
                },
                ElementStamp {
                    id: b,
                    edition_time_ms: stamp_of(&store, project, b),
                },
            ]),
        })
        .expect_err("any stale member of a multi claim must fail");
    assert!(matches!(
        err,
        StoreError::StaleState { node_id, .. } if node_id == a
    ));

    store
        .delete_treenode(DeleteTreenodeRequest {
            project_id: project,
            user_id: USER,
            node_id: b,
            state: StateDescriptor::Multi(vec![
                ElementStamp {
                    id: a,
                    edition_time_ms: stamp_of(&store, project, a),
                },
                ElementStamp {
                    id: b,
                    edition_time_ms: stamp_of(&store, project, b),
                },
            ]),
        })
        .expect("matching multi claim must pass");
}

#[test]
fn nothing_is_written_when_the_check_fails() {
    let (mut store, project) = open_project("atomic-reject");
    let node = create_node(&mut store, project, None, Point3::new(0.0, 0.0, 0.0));
    let skeleton = store.treenode(project, node).expect("node").skeleton_id;
    let before = store
        .skeleton_summary(project, skeleton)
        .expect("summary exists");

    let node_stamp = stamp_of(&store, project, node);
    let err = move_with(
        &mut store,
        project,
        node,
        StateDescriptor::Node {
            edition_time_ms: node_stamp - 1,
        },
    )
    .expect_err("stale move must fail");
    assert!(matches!(err, StoreError::StaleState { .. }));

    let row = store.treenode(project, node).expect("node unchanged");
    assert_eq!((row.x, row.y, row.z), (0.0, 0.0, 0.0));
    let after = store
        .skeleton_summary(project, skeleton)
        .expect("summary unchanged");
    assert_eq!(before, after);
}

#[test]
fn connector_state_allows_only_bypass_and_single_stamp() {
    let (mut store, project) = open_project("connector-shapes");
    let connector = store
        .create_connector(CreateConnectorRequest {
            project_id: project,
            user_id: USER,
            location: Point3::new(0.0, 0.0, 0.0),
            confidence: 5,
        })
        .expect("connector should be created");
    let stamp = store
        .connector(project, connector)
        .expect("connector")
        .edition_time_ms;

    let err = store
        .move_connector(MoveConnectorRequest {
            project_id: project,
            user_id: USER,
            connector_id: connector,
            location: Point3::new(1.0, 1.0, 1.0),
            state: StateDescriptor::Neighborhood {
                edition_time_ms: stamp,
                parent: None,
                children: None,
                links: None,
            },
        })
        .expect_err("neighborhood shape is meaningless for connectors");
    assert!(matches!(err, StoreError::InvalidInput(_)));

    let err = store
        .move_connector(MoveConnectorRequest {
            project_id: project,
            user_id: USER,
            connector_id: connector,
            location: Point3::new(1.0, 1.0, 1.0),
            state: StateDescriptor::Node {
                edition_time_ms: stamp - 1,
            },
        })
        .expect_err("stale connector stamp must fail");
    assert!(matches!(err, StoreError::StaleState { .. }));

    store
        .move_connector(MoveConnectorRequest {
            project_id: project,
            user_id: USER,
            connector_id: connector,
            location: Point3::new(1.0, 1.0, 1.0),
            state: StateDescriptor::Node {
                edition_time_ms: stamp,
            },
        })
        .expect("matching connector stamp must pass");
}
