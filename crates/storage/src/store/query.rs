#![forbid(unsafe_code)]

//! Spatial node queries. The direct path filters on the materialized edge
//! tables so a node is returned whenever any edge touching it crosses the
//! query box; the cached path must reproduce exactly that rule, which is why
//! cache payloads carry each row's edge box.

use super::support::{perm_tx, sql_placeholders, state_tx};
use super::{
    ConnectorLinkRow, ConnectorRow, ListNodesRequest, NodeQueryResult, SqliteStore, StoreError,
    TreenodeRow, TruncationPolicy, validate_project_user,
};
use nr_core::geom::Aabb;
use nr_core::model::Role;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Default)]
pub(in crate::store) struct BoxQuery {
    pub treenodes: Vec<TreenodeRow>,
    pub connectors: Vec<ConnectorRow>,
}

impl SqliteStore {
    /// Nodes and connectors intersecting an axis-aligned box, with optional
    /// level-of-detail thinning and a whole-skeleton node limit.
    pub fn list_nodes(&self, request: ListNodesRequest) -> Result<NodeQueryResult, StoreError> {
        validate_project_user(request.project_id, request.user_id)?;
        let bounds = Aabb::try_new(request.min, request.max)
            .map_err(|err| StoreError::InvalidInput(err.message()))?;
        if let Some(0) = request.limit {
            return Err(StoreError::InvalidInput("node limit must be positive"));
        }
        perm_tx::require_role_tx(
            &self.conn,
            request.project_id,
            request.user_id,
            Role::Browse,
        )?;

        let cached = match request.grid_id {
            None => None,
            Some(grid_id) => {
                super::cache::try_cached_query(&self.conn, request.project_id, grid_id, &bounds)?
            }
        };
        let mut result = match cached {
            Some(result) => result,
            None => box_query_tx(&self.conn, request.project_id, &bounds)?,
        };

        if let Some(level) = request.lod_level
            && level > 0
        {
            lod_filter(&mut result.treenodes, level);
        }

        let mut truncated = false;
        if let Some(limit) = request.limit
            && result.treenodes.len() > limit
        {
            truncated = true;
            result.treenodes = admit_skeletons(result.treenodes, limit, request.policy);
        }

        Ok(NodeQueryResult {
            treenodes: result.treenodes,
            connectors: result.connectors,
            truncated,
        })
    }
}

/// Direct (uncached) box query against the materialized edges. Parents of
/// matched nodes are included even when they lie outside the box, so clients
/// can always draw the connecting edge.
pub(in crate::store) fn box_query_tx(
    conn: &Connection,
    project_id: i64,
    bounds: &Aabb,
) -> Result<BoxQuery, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.parent_id, t.x, t.y, t.z, t.confidence, t.radius, t.skeleton_id, \
         t.edition_time_ms, t.user_id \
         FROM treenodes t JOIN treenode_edges e ON e.treenode_id = t.id \
         WHERE e.project_id=?1 AND e.min_x<=?2 AND e.max_x>=?3 AND e.min_y<=?4 \
         AND e.max_y>=?5 AND e.min_z<=?6 AND e.max_z>=?7 ORDER BY t.id",
    )?;
    let mut rows = stmt.query(params![
        project_id,
        bounds.max().x,
        bounds.min().x,
        bounds.max().y,
        bounds.min().y,
        bounds.max().z,
        bounds.min().z,
    ])?;
    let mut treenodes = Vec::new();
    let mut seen = BTreeSet::new();
    while let Some(row) = rows.next()? {
        let node = read_treenode_row(row)?;
        seen.insert(node.id);
        treenodes.push(node);
    }
    drop(rows);
    drop(stmt);

    let missing_parents: Vec<i64> = treenodes
        .iter()
        .filter_map(|node| node.parent_id)
        .filter(|parent_id| !seen.contains(parent_id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    for parent in state_tx::nodes_by_ids_tx(conn, project_id, &missing_parents)? {
        treenodes.push(TreenodeRow {
            id: parent.id,
            parent_id: parent.parent_id,
            x: parent.x,
            y: parent.y,
            z: parent.z,
            confidence: parent.confidence,
            radius: parent.radius,
            skeleton_id: parent.skeleton_id,
            edition_time_ms: parent.edition_time_ms,
            user_id: 0,
        });
    }
    // Re-read creator ids for the appended parents in one pass.
    fill_parent_creators(conn, &mut treenodes, &missing_parents)?;
    treenodes.sort_by_key(|node| node.id);

    let connectors = connectors_in_box_tx(conn, project_id, bounds)?;
    Ok(BoxQuery {
        treenodes,
        connectors,
    })
}

fn fill_parent_creators(
    conn: &Connection,
    treenodes: &mut [TreenodeRow],
    parent_ids: &[i64],
) -> Result<(), StoreError> {
    if parent_ids.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "SELECT id, user_id FROM treenodes WHERE id IN ({})",
        sql_placeholders(parent_ids.len())
    );
    let values: Vec<SqlValue> = parent_ids.iter().map(|id| SqlValue::Integer(*id)).collect();
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    let mut creators = BTreeMap::new();
    while let Some(row) = rows.next()? {
        creators.insert(row.get::<_, i64>(0)?, row.get::<_, i64>(1)?);
    }
    for node in treenodes {
        if let Some(user_id) = creators.get(&node.id) {
            node.user_id = *user_id;
        }
    }
    Ok(())
}

/// Connectors whose own location or any of whose link edges crosses the box.
fn connectors_in_box_tx(
    conn: &Connection,
    project_id: i64,
    bounds: &Aabb,
) -> Result<Vec<ConnectorRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT c.id, c.x, c.y, c.z, c.confidence, c.edition_time_ms, c.user_id \
         FROM connectors c LEFT JOIN connector_edges e ON e.connector_id = c.id \
         WHERE c.project_id=?1 AND ( \
           (c.x BETWEEN ?2 AND ?3 AND c.y BETWEEN ?4 AND ?5 AND c.z BETWEEN ?6 AND ?7) \
           OR (e.min_x<=?3 AND e.max_x>=?2 AND e.min_y<=?5 AND e.max_y>=?4 \
               AND e.min_z<=?7 AND e.max_z>=?6)) \
         ORDER BY c.id",
    )?;
    let mut rows = stmt.query(params![
        project_id,
        bounds.min().x,
        bounds.max().x,
        bounds.min().y,
        bounds.max().y,
        bounds.min().z,
        bounds.max().z,
    ])?;
    let mut connectors = Vec::new();
    while let Some(row) = rows.next()? {
        connectors.push(ConnectorRow {
            id: row.get(0)?,
            x: row.get(1)?,
            y: row.get(2)?,
            z: row.get(3)?,
            confidence: row.get(4)?,
            edition_time_ms: row.get(5)?,
            user_id: row.get(6)?,
            links: Vec::new(),
        });
    }
    drop(rows);
    drop(stmt);

    for connector in &mut connectors {
        let mut stmt = conn.prepare(
            "SELECT id, treenode_id, relation, confidence, edition_time_ms \
             FROM treenode_connectors WHERE connector_id=?1 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![connector.id])?;
        while let Some(row) = rows.next()? {
            connector.links.push(ConnectorLinkRow {
                link_id: row.get(0)?,
                treenode_id: row.get(1)?,
                relation: row.get(2)?,
                confidence: row.get(3)?,
                edition_time_ms: row.get(4)?,
            });
        }
    }
    Ok(connectors)
}

fn read_treenode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TreenodeRow> {
    Ok(TreenodeRow {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        x: row.get(2)?,
        y: row.get(3)?,
        z: row.get(4)?,
        confidence: row.get(5)?,
        radius: row.get(6)?,
        skeleton_id: row.get(7)?,
        edition_time_ms: row.get(8)?,
        user_id: row.get(9)?,
    })
}

/// Deterministic thinning: roots always survive, other nodes survive when
/// their id falls on the level's stride. The same inputs at the same level
/// always produce the same subset.
pub(in crate::store) fn lod_filter(treenodes: &mut Vec<TreenodeRow>, level: u32) {
    let stride = 1i64 << level.min(16);
    treenodes.retain(|node| node.parent_id.is_none() || node.id % stride == 0);
}

/// Admits whole skeletons in policy order until the next one would exceed the
/// limit. Never returns a partial skeleton.
pub(in crate::store) fn admit_skeletons(
    treenodes: Vec<TreenodeRow>,
    limit: usize,
    policy: TruncationPolicy,
) -> Vec<TreenodeRow> {
    let mut by_skeleton: BTreeMap<i64, Vec<TreenodeRow>> = BTreeMap::new();
    for node in treenodes {
        by_skeleton.entry(node.skeleton_id).or_default().push(node);
    }

    let mut order: Vec<(i64, usize, i64)> = by_skeleton
        .iter()
        .map(|(skeleton_id, nodes)| {
            let latest = nodes.iter().map(|n| n.edition_time_ms).max().unwrap_or(0);
            (*skeleton_id, nodes.len(), latest)
        })
        .collect();
    match policy {
        TruncationPolicy::LargestSkeletonsFirst => {
            order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        }
        TruncationPolicy::MostRecentlyEdited => {
            order.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
        }
    }

    let mut admitted = Vec::new();
    for (skeleton_id, size, _) in order {
        if admitted.len() + size > limit {
            continue;
        }
        if let Some(nodes) = by_skeleton.remove(&skeleton_id) {
            admitted.extend(nodes);
        }
    }
    admitted.sort_by_key(|node| node.id);
    admitted
}
