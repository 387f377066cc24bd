#![forbid(unsafe_code)]

//! Materialized-edge maintenance. Every mutation that changes geometry or
//! structure calls into here within its own transaction, keeping exactly one
//! edge row per live treenode and per live link.

use super::state_tx::{LiveNode, get_connector_tx, get_node_tx};
use crate::store::StoreError;
use nr_core::geom::{Aabb, Point3};
use rusqlite::{Connection, OptionalExtension, params};

pub(in crate::store) fn upsert_treenode_edge_tx(
    conn: &Connection,
    node: &LiveNode,
    parent_location: Option<Point3>,
) -> Result<(), StoreError> {
    let a = node.location();
    // Roots carry a self-referencing (degenerate) edge.
    let b = parent_location.unwrap_or(a);
    conn.execute(
        "INSERT INTO treenode_edges(treenode_id, project_id, x1, y1, z1, x2, y2, z2, \
         min_x, min_y, min_z, max_x, max_y, max_z) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
         ON CONFLICT(treenode_id) DO UPDATE SET \
         x1=excluded.x1, y1=excluded.y1, z1=excluded.z1, \
         x2=excluded.x2, y2=excluded.y2, z2=excluded.z2, \
         min_x=excluded.min_x, min_y=excluded.min_y, min_z=excluded.min_z, \
         max_x=excluded.max_x, max_y=excluded.max_y, max_z=excluded.max_z",
        params![
            node.id,
            node.project_id,
            a.x,
            a.y,
            a.z,
            b.x,
            b.y,
            b.z,
            a.x.min(b.x),
            a.y.min(b.y),
            a.z.min(b.z),
            a.x.max(b.x),
            a.y.max(b.y),
            a.z.max(b.z),
        ],
    )?;
    Ok(())
}

/// Re-reads the node and its parent and rewrites the edge row.
pub(in crate::store) fn refresh_treenode_edge_tx(
    conn: &Connection,
    project_id: i64,
    node_id: i64,
) -> Result<(), StoreError> {
    let node = get_node_tx(conn, project_id, node_id)?;
    let parent_location = match node.parent_id {
        None => None,
        Some(parent_id) => Some(get_node_tx(conn, project_id, parent_id)?.location()),
    };
    upsert_treenode_edge_tx(conn, &node, parent_location)
}

pub(in crate::store) fn delete_treenode_edge_tx(
    conn: &Connection,
    node_id: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM treenode_edges WHERE treenode_id=?1",
        params![node_id],
    )?;
    Ok(())
}

pub(in crate::store) fn upsert_connector_edge_tx(
    conn: &Connection,
    link_id: i64,
    project_id: i64,
    treenode_id: i64,
    connector_id: i64,
    a: Point3,
    b: Point3,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO connector_edges(link_id, project_id, treenode_id, connector_id, \
         x1, y1, z1, x2, y2, z2, min_x, min_y, min_z, max_x, max_y, max_z) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) \
         ON CONFLICT(link_id) DO UPDATE SET \
         x1=excluded.x1, y1=excluded.y1, z1=excluded.z1, \
         x2=excluded.x2, y2=excluded.y2, z2=excluded.z2, \
         min_x=excluded.min_x, min_y=excluded.min_y, min_z=excluded.min_z, \
         max_x=excluded.max_x, max_y=excluded.max_y, max_z=excluded.max_z",
        params![
            link_id,
            project_id,
            treenode_id,
            connector_id,
            a.x,
            a.y,
            a.z,
            b.x,
            b.y,
            b.z,
            a.x.min(b.x),
            a.y.min(b.y),
            a.z.min(b.z),
            a.x.max(b.x),
            a.y.max(b.y),
            a.z.max(b.z),
        ],
    )?;
    Ok(())
}

pub(in crate::store) fn delete_connector_edge_tx(
    conn: &Connection,
    link_id: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "DELETE FROM connector_edges WHERE link_id=?1",
        params![link_id],
    )?;
    Ok(())
}

/// Rewrites every link edge touching the node after the node moved.
pub(in crate::store) fn refresh_link_edges_for_node_tx(
    conn: &Connection,
    project_id: i64,
    node_id: i64,
) -> Result<(), StoreError> {
    let node = get_node_tx(conn, project_id, node_id)?;
    let mut stmt = conn.prepare(
        "SELECT id, connector_id FROM treenode_connectors WHERE treenode_id=?1",
    )?;
    let mut rows = stmt.query(params![node_id])?;
    let mut links = Vec::new();
    while let Some(row) = rows.next()? {
        links.push((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?));
    }
    for (link_id, connector_id) in links {
        let connector = get_connector_tx(conn, project_id, connector_id)?;
        upsert_connector_edge_tx(
            conn,
            link_id,
            project_id,
            node_id,
            connector_id,
            node.location(),
            connector.location(),
        )?;
    }
    Ok(())
}

/// Rewrites every link edge touching the connector after the connector moved.
pub(in crate::store) fn refresh_link_edges_for_connector_tx(
    conn: &Connection,
    project_id: i64,
    connector_id: i64,
) -> Result<(), StoreError> {
    let connector = get_connector_tx(conn, project_id, connector_id)?;
    let mut stmt = conn.prepare(
        "SELECT id, treenode_id FROM treenode_connectors WHERE connector_id=?1",
    )?;
    let mut rows = stmt.query(params![connector_id])?;
    let mut links = Vec::new();
    while let Some(row) = rows.next()? {
        links.push((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?));
    }
    for (link_id, treenode_id) in links {
        let node = get_node_tx(conn, project_id, treenode_id)?;
        upsert_connector_edge_tx(
            conn,
            link_id,
            project_id,
            treenode_id,
            connector_id,
            node.location(),
            connector.location(),
        )?;
    }
    Ok(())
}

/// Union box of every materialized edge that starts or ends at the node,
/// used as the change-notification geometry for moves and deletes.
pub(in crate::store) fn incident_bounds_tx(
    conn: &Connection,
    node_id: i64,
) -> Result<Option<Aabb>, StoreError> {
    let mut bounds: Option<Aabb> = None;

    let own: Option<(f64, f64, f64, f64, f64, f64)> = conn
        .query_row(
            "SELECT min_x, min_y, min_z, max_x, max_y, max_z FROM treenode_edges \
             WHERE treenode_id=?1",
            params![node_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )
        .optional()?;
    if let Some(b) = own {
        bounds = Some(merge_bounds(bounds, b));
    }

    let mut stmt = conn.prepare(
        "SELECT e.min_x, e.min_y, e.min_z, e.max_x, e.max_y, e.max_z \
         FROM treenode_edges e JOIN treenodes t ON t.id = e.treenode_id \
         WHERE t.parent_id=?1",
    )?;
    let mut rows = stmt.query(params![node_id])?;
    while let Some(row) = rows.next()? {
        let b = (
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        );
        bounds = Some(merge_bounds(bounds, b));
    }

    let mut stmt = conn.prepare(
        "SELECT min_x, min_y, min_z, max_x, max_y, max_z FROM connector_edges \
         WHERE treenode_id=?1",
    )?;
    let mut rows = stmt.query(params![node_id])?;
    while let Some(row) = rows.next()? {
        let b = (
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        );
        bounds = Some(merge_bounds(bounds, b));
    }

    Ok(bounds)
}

fn merge_bounds(
    current: Option<Aabb>,
    (min_x, min_y, min_z, max_x, max_y, max_z): (f64, f64, f64, f64, f64, f64),
) -> Aabb {
    let other = Aabb::of_segment(
        Point3::new(min_x, min_y, min_z),
        Point3::new(max_x, max_y, max_z),
    );
    match current {
        None => other,
        Some(current) => current.union(&other),
    }
}
