#![forbid(unsafe_code)]

use nr_core::geom::Point3;
use nr_core::state::StateDescriptor;

#[derive(Clone, Debug, PartialEq)]
pub struct CreateTreenodeRequest {
    pub project_id: i64,
    pub user_id: i64,
    /// None creates a new root (and a fresh skeleton).
    pub parent_id: Option<i64>,
    pub location: Point3,
    pub radius: f64,
    pub confidence: i64,
    /// Checked against the parent when creating a child node; ignored for
    /// roots, which have nothing to race against.
    pub state: StateDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MoveTreenodeRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub node_id: i64,
    pub location: Point3,
    pub state: StateDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReparentTreenodeRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub node_id: i64,
    pub new_parent_id: i64,
    pub state: StateDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateRadiusRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub node_id: i64,
    pub radius: f64,
    pub state: StateDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateConfidenceRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub node_id: i64,
    pub confidence: i64,
    pub state: StateDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteTreenodeRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub node_id: i64,
    pub state: StateDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CreateConnectorRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub location: Point3,
    pub confidence: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MoveConnectorRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub connector_id: i64,
    pub location: Point3,
    /// Only the Bypass and Node shapes apply to connectors.
    pub state: StateDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteConnectorRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub connector_id: i64,
    pub state: StateDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AddLinkRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub treenode_id: i64,
    pub connector_id: i64,
    pub relation: nr_core::model::RelationKind,
    pub confidence: i64,
    pub treenode_state: StateDescriptor,
    /// Bypass/Node shapes only, checked against the connector.
    pub connector_state: StateDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoveLinkRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub link_id: i64,
    /// Checked against the link's treenode.
    pub state: StateDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SplitSkeletonRequest {
    pub project_id: i64,
    pub user_id: i64,
    /// Root of the subtree to detach into a new skeleton.
    pub node_id: i64,
    pub state: StateDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JoinSkeletonsRequest {
    pub project_id: i64,
    pub user_id: i64,
    /// Node in the surviving skeleton that becomes the new parent.
    pub from_node_id: i64,
    /// Node in the absorbed skeleton; it is rerooted and attached.
    pub to_node_id: i64,
    pub from_state: StateDescriptor,
    pub to_state: StateDescriptor,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddNodeTagRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub node_id: i64,
    pub tag: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveNodeTagRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub node_id: i64,
    pub tag: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarkReviewedRequest {
    pub project_id: i64,
    pub reviewer_id: i64,
    pub node_id: i64,
}

/// Which skeletons win when a node limit truncates the result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TruncationPolicy {
    #[default]
    LargestSkeletonsFirst,
    MostRecentlyEdited,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ListNodesRequest {
    pub project_id: i64,
    pub user_id: i64,
    pub min: Point3,
    pub max: Point3,
    pub limit: Option<usize>,
    pub policy: TruncationPolicy,
    /// 0 (or None) returns every node; higher levels thin deterministically.
    pub lod_level: Option<u32>,
    /// Grid cache to consult; unknown or unprovisioned ids fall back to the
    /// direct query.
    pub grid_id: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CreateGridCacheRequest {
    pub project_id: i64,
    pub orientation: String,
    pub cell_width: f64,
    pub cell_height: f64,
    pub cell_depth: f64,
    pub lod_levels: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TreenodeRow {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub confidence: i64,
    pub radius: f64,
    pub skeleton_id: i64,
    pub edition_time_ms: i64,
    pub user_id: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectorLinkRow {
    pub link_id: i64,
    pub treenode_id: i64,
    pub relation: String,
    pub confidence: i64,
    pub edition_time_ms: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectorRow {
    pub id: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub confidence: i64,
    pub edition_time_ms: i64,
    pub user_id: i64,
    pub links: Vec<ConnectorLinkRow>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeQueryResult {
    pub treenodes: Vec<TreenodeRow>,
    pub connectors: Vec<ConnectorRow>,
    pub truncated: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SkeletonSummaryRow {
    pub skeleton_id: i64,
    pub project_id: i64,
    pub node_count: i64,
    pub cable_length: f64,
    pub last_edit_ms: i64,
    pub last_editor_id: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeRebuildReport {
    pub treenode_edges_before: i64,
    pub treenode_edges_after: i64,
    pub connector_edges_before: i64,
    pub connector_edges_after: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryRebuildReport {
    pub summaries_before: i64,
    pub summaries_after: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpatialDrainReport {
    pub updates_drained: usize,
    pub cells_marked: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GridCacheConfig {
    pub id: i64,
    pub project_id: i64,
    pub orientation: String,
    pub spec: nr_core::geom::GridSpec,
    pub lod_levels: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TreenodeVersionRow {
    pub node_id: i64,
    pub skeleton_id: i64,
    pub parent_id: Option<i64>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub radius: f64,
    pub confidence: i64,
    pub editor_id: i64,
    pub valid_from_ms: i64,
    pub valid_to_ms: i64,
    pub txid: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub repairs: Vec<String>,
    pub warnings: Vec<String>,
}

impl StartupReport {
    pub fn is_clean(&self) -> bool {
        self.repairs.is_empty() && self.warnings.is_empty()
    }
}
