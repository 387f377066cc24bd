#![forbid(unsafe_code)]

//! The optimistic-concurrency check: every claim in a client's state
//! descriptor is verified as its own named predicate, and all of them must
//! hold before a mutation may write. Each predicate queries the live rows
//! inside the mutation's transaction, so the whole conjunction is atomic with
//! the write that follows.

use super::sql_placeholders;
use crate::store::StoreError;
use nr_core::geom::Point3;
use nr_core::state::{ElementStamp, ParentState, StateDescriptor};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
pub(in crate::store) struct LiveNode {
    pub id: i64,
    pub project_id: i64,
    pub skeleton_id: i64,
    pub parent_id: Option<i64>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub radius: f64,
    pub confidence: i64,
    pub edition_time_ms: i64,
}

impl LiveNode {
    pub fn location(&self) -> Point3 {
        Point3::new(self.x, self.y, self.z)
    }
}

pub(in crate::store) fn get_node_tx(
    conn: &Connection,
    project_id: i64,
    node_id: i64,
) -> Result<LiveNode, StoreError> {
    let node = conn
        .query_row(
            "SELECT id, project_id, skeleton_id, parent_id, x, y, z, radius, confidence, \
             edition_time_ms FROM treenodes WHERE id=?1 AND project_id=?2",
            params![node_id, project_id],
            |row| {
                Ok(LiveNode {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    skeleton_id: row.get(2)?,
                    parent_id: row.get(3)?,
                    x: row.get(4)?,
                    y: row.get(5)?,
                    z: row.get(6)?,
                    radius: row.get(7)?,
                    confidence: row.get(8)?,
                    edition_time_ms: row.get(9)?,
                })
            },
        )
        .optional()?;
    node.ok_or(StoreError::UnknownNode { node_id })
}

#[derive(Clone, Debug)]
pub(in crate::store) struct LiveConnector {
    pub id: i64,
    pub project_id: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub edition_time_ms: i64,
}

impl LiveConnector {
    pub fn location(&self) -> Point3 {
        Point3::new(self.x, self.y, self.z)
    }
}

pub(in crate::store) fn get_connector_tx(
    conn: &Connection,
    project_id: i64,
    connector_id: i64,
) -> Result<LiveConnector, StoreError> {
    let connector = conn
        .query_row(
            "SELECT id, project_id, x, y, z, edition_time_ms FROM connectors \
             WHERE id=?1 AND project_id=?2",
            params![connector_id, project_id],
            |row| {
                Ok(LiveConnector {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    x: row.get(2)?,
                    y: row.get(3)?,
                    z: row.get(4)?,
                    edition_time_ms: row.get(5)?,
                })
            },
        )
        .optional()?;
    connector.ok_or(StoreError::UnknownConnector { connector_id })
}

/// Pins the implicated rows for the rest of the transaction. The IMMEDIATE
/// transaction already holds the writer lock; this step resolves every id so
/// a vanished row surfaces as UnknownNode rather than a stale-state conflict.
pub(in crate::store) fn lock_nodes_tx(
    conn: &Connection,
    project_id: i64,
    node_ids: &[i64],
) -> Result<(), StoreError> {
    for &node_id in node_ids {
        let present: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM treenodes WHERE id=?1 AND project_id=?2",
                params![node_id, project_id],
                |row| row.get(0),
            )
            .optional()?;
        if present.is_none() {
            return Err(StoreError::UnknownNode { node_id });
        }
    }
    Ok(())
}

// --- predicates ---------------------------------------------------------

fn node_stamp_matches_tx(
    conn: &Connection,
    node_id: i64,
    expected_ms: i64,
) -> Result<bool, StoreError> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM treenodes WHERE id=?1 AND edition_time_ms=?2",
            params![node_id, expected_ms],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

/// "No parent exists", checked against the live row rather than comparing a
/// possibly stale null.
fn is_root_tx(conn: &Connection, node_id: i64) -> Result<bool, StoreError> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM treenodes WHERE id=?1 AND parent_id IS NULL",
            params![node_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn is_parent_of_tx(
    conn: &Connection,
    parent_id: i64,
    child_id: i64,
) -> Result<bool, StoreError> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM treenodes WHERE id=?1 AND parent_id=?2",
            params![child_id, parent_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

/// Exact-set comparison: an extra live child, a missing claimed child, or a
/// stamp mismatch all fail. Subset containment is not enough; a live child
/// absent from the claim is exactly the stale-child race this guards against.
fn children_match_tx(
    conn: &Connection,
    node_id: i64,
    claimed: &[ElementStamp],
) -> Result<bool, StoreError> {
    let mut stmt =
        conn.prepare("SELECT id, edition_time_ms FROM treenodes WHERE parent_id=?1")?;
    let mut rows = stmt.query(params![node_id])?;
    let mut live = BTreeMap::new();
    while let Some(row) = rows.next()? {
        live.insert(row.get::<_, i64>(0)?, row.get::<_, i64>(1)?);
    }
    stamps_match_exactly(&live, claimed)
}

fn links_match_tx(
    conn: &Connection,
    node_id: i64,
    claimed: &[ElementStamp],
) -> Result<bool, StoreError> {
    let mut stmt = conn
        .prepare("SELECT id, edition_time_ms FROM treenode_connectors WHERE treenode_id=?1")?;
    let mut rows = stmt.query(params![node_id])?;
    let mut live = BTreeMap::new();
    while let Some(row) = rows.next()? {
        live.insert(row.get::<_, i64>(0)?, row.get::<_, i64>(1)?);
    }
    stamps_match_exactly(&live, claimed)
}

fn stamps_match_exactly(
    live: &BTreeMap<i64, i64>,
    claimed: &[ElementStamp],
) -> Result<bool, StoreError> {
    let mut seen = BTreeMap::new();
    for stamp in claimed {
        // A duplicated claim with conflicting stamps can never match.
        if seen.insert(stamp.id, stamp.edition_time_ms).is_some_and(|prev| prev != stamp.edition_time_ms) {
            return Ok(false);
        }
    }
    Ok(seen == *live)
}

// --- combinators --------------------------------------------------------

/// All-must-pass conjunction of the descriptor's claims against one node.
pub(in crate::store) fn check_state_tx(
    conn: &Connection,
    project_id: i64,
    node_id: i64,
    state: &StateDescriptor,
) -> Result<(), StoreError> {
    lock_nodes_tx(conn, project_id, &state.implicated_node_ids(node_id))?;

    match state {
        StateDescriptor::Bypass => Ok(()),
        StateDescriptor::Node { edition_time_ms } => {
            if !node_stamp_matches_tx(conn, node_id, *edition_time_ms)? {
                return Err(StoreError::StaleState {
                    node_id,
                    reason: "edition time mismatch",
                });
            }
            Ok(())
        }
        StateDescriptor::Neighborhood {
            edition_time_ms,
            parent,
            children,
            links,
        } => {
            if !node_stamp_matches_tx(conn, node_id, *edition_time_ms)? {
                return Err(StoreError::StaleState {
                    node_id,
                    reason: "edition time mismatch",
                });
            }
            match parent {
                None => {}
                Some(ParentState::Root) => {
                    if !is_root_tx(conn, node_id)? {
                        return Err(StoreError::StaleState {
                            node_id,
                            reason: "node is no longer a root",
                        });
                    }
                }
                Some(ParentState::Node(stamp)) => {
                    if !is_parent_of_tx(conn, stamp.id, node_id)? {
                        return Err(StoreError::StaleState {
                            node_id,
                            reason: "claimed parent is not the live parent",
                        });
                    }
                    if !node_stamp_matches_tx(conn, stamp.id, stamp.edition_time_ms)? {
                        return Err(StoreError::StaleState {
                            node_id: stamp.id,
                            reason: "parent edition time mismatch",
                        });
                    }
                }
            }
            if let Some(children) = children
                && !children_match_tx(conn, node_id, children)?
            {
                return Err(StoreError::StaleState {
                    node_id,
                    reason: "children set does not match",
                });
            }
            if let Some(links) = links
                && !links_match_tx(conn, node_id, links)?
            {
                return Err(StoreError::StaleState {
                    node_id,
                    reason: "link set does not match",
                });
            }
            Ok(())
        }
        StateDescriptor::Multi(stamps) => {
            for stamp in stamps {
                if !node_stamp_matches_tx(conn, stamp.id, stamp.edition_time_ms)? {
                    return Err(StoreError::StaleState {
                        node_id: stamp.id,
                        reason: "edition time mismatch",
                    });
                }
            }
            Ok(())
        }
    }
}

/// Connector variant; connectors have no tree structure, so only the Bypass
/// and Node shapes are meaningful.
pub(in crate::store) fn check_connector_state_tx(
    conn: &Connection,
    project_id: i64,
    connector_id: i64,
    state: &StateDescriptor,
) -> Result<(), StoreError> {
    let live = get_connector_tx(conn, project_id, connector_id)?;
    match state {
        StateDescriptor::Bypass => Ok(()),
        StateDescriptor::Node { edition_time_ms } => {
            if live.edition_time_ms != *edition_time_ms {
                return Err(StoreError::StaleState {
                    node_id: connector_id,
                    reason: "connector edition time mismatch",
                });
            }
            Ok(())
        }
        _ => Err(StoreError::InvalidInput(
            "connector state must be the bypass or single-stamp shape",
        )),
    }
}

pub(in crate::store) fn children_of_tx(
    conn: &Connection,
    node_id: i64,
) -> Result<Vec<LiveNode>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, project_id, skeleton_id, parent_id, x, y, z, radius, confidence, \
         edition_time_ms FROM treenodes WHERE parent_id=?1 ORDER BY id",
    )?;
    let mut rows = stmt.query(params![node_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(LiveNode {
            id: row.get(0)?,
            project_id: row.get(1)?,
            skeleton_id: row.get(2)?,
            parent_id: row.get(3)?,
            x: row.get(4)?,
            y: row.get(5)?,
            z: row.get(6)?,
            radius: row.get(7)?,
            confidence: row.get(8)?,
            edition_time_ms: row.get(9)?,
        });
    }
    Ok(out)
}

/// Subtree ids rooted at a node, the node itself included.
pub(in crate::store) fn subtree_ids_tx(
    conn: &Connection,
    node_id: i64,
) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn.prepare(
        "WITH RECURSIVE subtree(id) AS ( \
           SELECT id FROM treenodes WHERE id=?1 \
           UNION ALL \
           SELECT t.id FROM treenodes t JOIN subtree s ON t.parent_id = s.id \
         ) SELECT id FROM subtree ORDER BY id",
    )?;
    let mut rows = stmt.query(params![node_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get(0)?);
    }
    Ok(out)
}

/// Ancestor chain starting at the node and ending at its root.
pub(in crate::store) fn ancestor_chain_tx(
    conn: &Connection,
    project_id: i64,
    node_id: i64,
) -> Result<Vec<i64>, StoreError> {
    let mut chain = vec![node_id];
    let mut current = node_id;
    loop {
        let parent: Option<Option<i64>> = conn
            .query_row(
                "SELECT parent_id FROM treenodes WHERE id=?1 AND project_id=?2",
                params![current, project_id],
                |row| row.get(0),
            )
            .optional()?;
        match parent {
            None => return Err(StoreError::UnknownNode { node_id: current }),
            Some(None) => return Ok(chain),
            Some(Some(parent_id)) => {
                if chain.contains(&parent_id) {
                    // A cycle here means corrupted data; refuse to loop.
                    return Err(StoreError::StructuralViolation {
                        node_id: parent_id,
                        constraint: "parent chain contains a cycle",
                    });
                }
                chain.push(parent_id);
                current = parent_id;
            }
        }
    }
}

pub(in crate::store) fn nodes_by_ids_tx(
    conn: &Connection,
    project_id: i64,
    ids: &[i64],
) -> Result<Vec<LiveNode>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT id, project_id, skeleton_id, parent_id, x, y, z, radius, confidence, \
         edition_time_ms FROM treenodes WHERE project_id=? AND id IN ({}) ORDER BY id",
        sql_placeholders(ids.len())
    );
    let mut values = vec![SqlValue::Integer(project_id)];
    values.extend(ids.iter().map(|id| SqlValue::Integer(*id)));
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(values.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(LiveNode {
            id: row.get(0)?,
            project_id: row.get(1)?,
            skeleton_id: row.get(2)?,
            parent_id: row.get(3)?,
            x: row.get(4)?,
            y: row.get(5)?,
            z: row.get(6)?,
            radius: row.get(7)?,
            confidence: row.get(8)?,
            edition_time_ms: row.get(9)?,
        });
    }
    Ok(out)
}
