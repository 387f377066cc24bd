#![forbid(unsafe_code)]

//! Grid-cell node cache. Cells store the exact direct-query result for their
//! bounds as compact JSON, plus each row's own edge box so a cached lookup
//! can re-filter against the actual query box. Any miss, dirty mark, or
//! payload corruption silently falls back to the direct query.

use super::query::{BoxQuery, box_query_tx};
use super::support::state_tx;
use super::{
    ConnectorLinkRow, ConnectorRow, CreateGridCacheRequest, GridCacheConfig, SqliteStore,
    StoreError, TreenodeRow, now_ms,
};
use nr_core::geom::{Aabb, CellIndex, GridSpec, Point3};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

const ORIENTATIONS: &[&str] = &["xy", "xz", "zy"];

pub(in crate::store) fn grid_config_tx(
    conn: &Connection,
    grid_id: i64,
) -> Result<GridCacheConfig, StoreError> {
    let row: Option<(i64, i64, String, f64, f64, f64, i64)> = conn
        .query_row(
            "SELECT id, project_id, orientation, cell_width, cell_height, cell_depth, \
             lod_levels FROM node_grid_caches WHERE id=?1",
            params![grid_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )
        .optional()?;
    let (id, project_id, orientation, w, h, d, lod_levels) =
        row.ok_or(StoreError::UnknownGrid { grid_id })?;
    let spec = GridSpec::try_new(w, h, d)
        .map_err(|err| StoreError::InvalidInput(err.message()))?;
    Ok(GridCacheConfig {
        id,
        project_id,
        orientation,
        spec,
        lod_levels,
    })
}

pub(in crate::store) fn grid_configs_for_project_tx(
    conn: &Connection,
    project_id: i64,
) -> Result<Vec<GridCacheConfig>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM node_grid_caches WHERE project_id=?1 ORDER BY id",
    )?;
    let mut rows = stmt.query(params![project_id])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        ids.push(row.get::<_, i64>(0)?);
    }
    drop(rows);
    drop(stmt);
    ids.into_iter().map(|id| grid_config_tx(conn, id)).collect()
}

impl SqliteStore {
    pub fn create_node_grid_cache(
        &mut self,
        request: CreateGridCacheRequest,
    ) -> Result<i64, StoreError> {
        if !ORIENTATIONS.contains(&request.orientation.as_str()) {
            return Err(StoreError::InvalidInput(
                "orientation must be one of xy, xz, zy",
            ));
        }
        GridSpec::try_new(request.cell_width, request.cell_height, request.cell_depth)
            .map_err(|err| StoreError::InvalidInput(err.message()))?;
        if request.lod_levels < 1 {
            return Err(StoreError::InvalidInput("lod_levels must be at least 1"));
        }

        let tx = self.mutation_tx()?;
        let present: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM projects WHERE id=?1",
                params![request.project_id],
                |row| row.get(0),
            )
            .optional()?;
        if present.is_none() {
            return Err(StoreError::UnknownProject {
                project_id: request.project_id,
            });
        }
        tx.execute(
            "INSERT INTO node_grid_caches(project_id, orientation, cell_width, cell_height, \
             cell_depth, lod_levels, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                request.project_id,
                request.orientation,
                request.cell_width,
                request.cell_height,
                request.cell_depth,
                request.lod_levels,
                now_ms(),
            ],
        )?;
        let grid_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(grid_id)
    }

    pub fn grid_config(&self, grid_id: i64) -> Result<GridCacheConfig, StoreError> {
        grid_config_tx(&self.conn, grid_id)
    }

    pub fn list_grid_caches(
        &self,
        project_id: i64,
    ) -> Result<Vec<GridCacheConfig>, StoreError> {
        grid_configs_for_project_tx(&self.conn, project_id)
    }

    /// Builds (or rebuilds) every cell covering the given box and clears
    /// their dirty marks. Returns the number of cells written.
    pub fn warm_grid_cache(
        &mut self,
        grid_id: i64,
        min: Point3,
        max: Point3,
    ) -> Result<usize, StoreError> {
        let bounds = Aabb::try_new(min, max)
            .map_err(|err| StoreError::InvalidInput(err.message()))?;
        let tx = self.mutation_tx()?;
        let grid = grid_config_tx(&tx, grid_id)?;
        let cells = grid.spec.cells_in_box(&bounds);
        for cell in &cells {
            build_cell_tx(&tx, &grid, *cell)?;
            tx.execute(
                "DELETE FROM dirty_cells WHERE grid_id=?1 AND cx=?2 AND cy=?3 AND cz=?4",
                params![grid_id, cell.x, cell.y, cell.z],
            )?;
        }
        let written = cells.len();
        tx.commit()?;
        Ok(written)
    }

    /// Rebuilds up to `batch` dirty cells of the grid. Cells never warmed are
    /// built on first refresh.
    pub fn refresh_dirty_cells(
        &mut self,
        grid_id: i64,
        batch: usize,
    ) -> Result<usize, StoreError> {
        if batch == 0 {
            return Err(StoreError::InvalidInput("batch must be positive"));
        }
        let tx = self.mutation_tx()?;
        let grid = grid_config_tx(&tx, grid_id)?;

        let mut stmt = tx.prepare(
            "SELECT cx, cy, cz FROM dirty_cells WHERE grid_id=?1 \
             ORDER BY marked_at_ms, cx, cy, cz LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![grid_id, batch as i64])?;
        let mut cells = Vec::new();
        while let Some(row) = rows.next()? {
            cells.push(CellIndex {
                x: row.get(0)?,
                y: row.get(1)?,
                z: row.get(2)?,
            });
        }
        drop(rows);
        drop(stmt);

        for cell in &cells {
            build_cell_tx(&tx, &grid, *cell)?;
            tx.execute(
                "DELETE FROM dirty_cells WHERE grid_id=?1 AND cx=?2 AND cy=?3 AND cz=?4",
                params![grid_id, cell.x, cell.y, cell.z],
            )?;
        }
        let refreshed = cells.len();
        tx.commit()?;
        Ok(refreshed)
    }

    pub fn dirty_cell_count(&self, grid_id: i64) -> Result<i64, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM dirty_cells WHERE grid_id=?1",
            params![grid_id],
            |row| row.get(0),
        )?)
    }
}

fn build_cell_tx(
    conn: &Connection,
    grid: &GridCacheConfig,
    cell: CellIndex,
) -> Result<(), StoreError> {
    let bounds = grid.spec.cell_bounds(cell);
    let result = box_query_tx(conn, grid.project_id, &bounds)?;
    let payload = encode_payload(conn, &result)?;
    let checksum = hex_digest(&payload);
    conn.execute(
        "INSERT INTO node_grid_cache_cells(grid_id, cx, cy, cz, payload_json, checksum, \
         updated_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(grid_id, cx, cy, cz) DO UPDATE SET \
         payload_json=excluded.payload_json, checksum=excluded.checksum, \
         updated_at_ms=excluded.updated_at_ms",
        params![grid.id, cell.x, cell.y, cell.z, payload, checksum, now_ms()],
    )?;
    Ok(())
}

/// Cached lookup. Returns None whenever the cache cannot answer exactly:
/// unknown grid, a covering cell missing or dirty, or a payload that fails
/// its checksum.
pub(in crate::store) fn try_cached_query(
    conn: &Connection,
    project_id: i64,
    grid_id: i64,
    bounds: &Aabb,
) -> Result<Option<BoxQuery>, StoreError> {
    let grid = match grid_config_tx(conn, grid_id) {
        Ok(grid) => grid,
        Err(StoreError::UnknownGrid { .. }) => return Ok(None),
        Err(err) => return Err(err),
    };
    if grid.project_id != project_id {
        return Ok(None);
    }

    let mut treenodes: BTreeMap<i64, (TreenodeRow, Aabb)> = BTreeMap::new();
    let mut connectors: BTreeMap<i64, ConnectorRow> = BTreeMap::new();
    for cell in grid.spec.cells_in_box(bounds) {
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT payload_json, checksum FROM node_grid_cache_cells \
                 WHERE grid_id=?1 AND cx=?2 AND cy=?3 AND cz=?4",
                params![grid.id, cell.x, cell.y, cell.z],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((payload, checksum)) = row else {
            return Ok(None);
        };
        let dirty: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM dirty_cells WHERE grid_id=?1 AND cx=?2 AND cy=?3 AND cz=?4",
                params![grid.id, cell.x, cell.y, cell.z],
                |row| row.get(0),
            )
            .optional()?;
        if dirty.is_some() {
            return Ok(None);
        }
        if hex_digest(&payload) != checksum {
            return Ok(None);
        }
        let Some(()) = decode_payload(&payload, bounds, &mut treenodes, &mut connectors)
        else {
            return Ok(None);
        };
    }

    // Parent augmentation against the merged rows; anything still missing is
    // fetched live (a parent can sit outside every covering cell).
    let kept: BTreeSet<i64> = treenodes.keys().copied().collect();
    let missing: Vec<i64> = treenodes
        .values()
        .filter_map(|(node, _)| node.parent_id)
        .filter(|parent_id| !kept.contains(parent_id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut out: Vec<TreenodeRow> = treenodes.into_values().map(|(node, _)| node).collect();
    for parent in state_tx::nodes_by_ids_tx(conn, project_id, &missing)? {
        let creator: i64 = conn.query_row(
            "SELECT user_id FROM treenodes WHERE id=?1",
            params![parent.id],
            |row| row.get(0),
        )?;
        out.push(TreenodeRow {
            id: parent.id,
            parent_id: parent.parent_id,
            x: parent.x,
            y: parent.y,
            z: parent.z,
            confidence: parent.confidence,
            radius: parent.radius,
            skeleton_id: parent.skeleton_id,
            edition_time_ms: parent.edition_time_ms,
            user_id: creator,
        });
    }
    out.sort_by_key(|node| node.id);

    Ok(Some(BoxQuery {
        treenodes: out,
        connectors: connectors.into_values().collect(),
    }))
}

fn encode_payload(conn: &Connection, result: &BoxQuery) -> Result<String, StoreError> {
    let mut t = Vec::new();
    for node in &result.treenodes {
        let own_edge: (f64, f64, f64, f64, f64, f64) = conn.query_row(
            "SELECT min_x, min_y, min_z, max_x, max_y, max_z FROM treenode_edges \
             WHERE treenode_id=?1",
            params![node.id],
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
        )?;
        t.push(json!([
            node.id,
            node.parent_id,
            node.x,
            node.y,
            node.z,
            node.confidence,
            node.radius,
            node.skeleton_id,
            node.edition_time_ms,
            node.user_id,
            [own_edge.0, own_edge.1, own_edge.2, own_edge.3, own_edge.4, own_edge.5],
        ]));
    }

    let mut c = Vec::new();
    for connector in &result.connectors {
        let mut links = Vec::new();
        for link in &connector.links {
            let edge: Option<(f64, f64, f64, f64, f64, f64)> = conn
                .query_row(
                    "SELECT min_x, min_y, min_z, max_x, max_y, max_z FROM connector_edges \
                     WHERE link_id=?1",
                    params![link.link_id],
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
            let edge = edge.map(|e| vec![e.0, e.1, e.2, e.3, e.4, e.5]);
            links.push(json!([
                link.link_id,
                link.treenode_id,
                link.relation,
                link.confidence,
                link.edition_time_ms,
                edge,
            ]));
        }
        c.push(json!([
            connector.id,
            connector.x,
            connector.y,
            connector.z,
            connector.confidence,
            connector.edition_time_ms,
            connector.user_id,
            links,
        ]));
    }

    Ok(json!({ "t": t, "c": c }).to_string())
}

/// Filters the cell's rows against the query box and merges them in. Returns
/// None on any structural surprise in the payload.
fn decode_payload(
    payload: &str,
    bounds: &Aabb,
    treenodes: &mut BTreeMap<i64, (TreenodeRow, Aabb)>,
    connectors: &mut BTreeMap<i64, ConnectorRow>,
) -> Option<()> {
    let value: Value = serde_json::from_str(payload).ok()?;
    for row in value.get("t")?.as_array()? {
        let row = row.as_array()?;
        if row.len() != 11 {
            return None;
        }
        let edge = box_from_value(&row[10])?;
        if !edge.intersects(bounds) {
            continue;
        }
        let node = TreenodeRow {
            id: row[0].as_i64()?,
            parent_id: if row[1].is_null() {
                None
            } else {
                Some(row[1].as_i64()?)
            },
            x: row[2].as_f64()?,
            y: row[3].as_f64()?,
            z: row[4].as_f64()?,
            confidence: row[5].as_i64()?,
            radius: row[6].as_f64()?,
            skeleton_id: row[7].as_i64()?,
            edition_time_ms: row[8].as_i64()?,
            user_id: row[9].as_i64()?,
        };
        treenodes.entry(node.id).or_insert((node, edge));
    }

    for row in value.get("c")?.as_array()? {
        let row = row.as_array()?;
        if row.len() != 8 {
            return None;
        }
        let location = Point3::new(row[1].as_f64()?, row[2].as_f64()?, row[3].as_f64()?);
        let mut links = Vec::new();
        let mut hit = bounds.contains(location);
        for link in row[7].as_array()? {
            let link = link.as_array()?;
            if link.len() != 6 {
                return None;
            }
            if !link[5].is_null() {
                let edge = box_from_value(&link[5])?;
                if edge.intersects(bounds) {
                    hit = true;
                }
            }
            links.push(ConnectorLinkRow {
                link_id: link[0].as_i64()?,
                treenode_id: link[1].as_i64()?,
                relation: link[2].as_str()?.to_string(),
                confidence: link[3].as_i64()?,
                edition_time_ms: link[4].as_i64()?,
            });
        }
        if !hit {
            continue;
        }
        let connector = ConnectorRow {
            id: row[0].as_i64()?,
            x: location.x,
            y: location.y,
            z: location.z,
            confidence: row[4].as_i64()?,
            edition_time_ms: row[5].as_i64()?,
            user_id: row[6].as_i64()?,
            links,
        };
        connectors.entry(connector.id).or_insert(connector);
    }
    Some(())
}

fn box_from_value(value: &Value) -> Option<Aabb> {
    let parts = value.as_array()?;
    if parts.len() != 6 {
        return None;
    }
    let mut v = [0.0f64; 6];
    for (slot, part) in v.iter_mut().zip(parts) {
        *slot = part.as_f64()?;
    }
    Some(Aabb::of_segment(
        Point3::new(v[0], v[1], v[2]),
        Point3::new(v[3], v[4], v[5]),
    ))
}

fn hex_digest(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
