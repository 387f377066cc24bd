#![forbid(unsafe_code)]

//! Change notification between mutations and the cache worker. Mutations
//! enqueue the geometry they touched; the worker drains the queue and marks
//! the covered grid cells dirty. The queue is a table rather than an
//! in-process channel so a separate worker process can drain it.

use super::support::sql_placeholders;
use super::{SpatialDrainReport, SqliteStore, StoreError, now_ms};
use nr_core::geom::{Aabb, Point3};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};

pub(in crate::store) fn enqueue_point_tx(
    conn: &Connection,
    project_id: i64,
    p: Point3,
    now: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO spatial_updates(project_id, kind, ax, ay, az, bx, by, bz, ts_ms) \
         VALUES (?1, 'point', ?2, ?3, ?4, ?2, ?3, ?4, ?5)",
        params![project_id, p.x, p.y, p.z, now],
    )?;
    Ok(())
}

pub(in crate::store) fn enqueue_segment_tx(
    conn: &Connection,
    project_id: i64,
    a: Point3,
    b: Point3,
    now: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO spatial_updates(project_id, kind, ax, ay, az, bx, by, bz, ts_ms) \
         VALUES (?1, 'segment', ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![project_id, a.x, a.y, a.z, b.x, b.y, b.z, now],
    )?;
    Ok(())
}

pub(in crate::store) fn enqueue_box_tx(
    conn: &Connection,
    project_id: i64,
    bounds: &Aabb,
    now: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO spatial_updates(project_id, kind, ax, ay, az, bx, by, bz, ts_ms) \
         VALUES (?1, 'box', ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            project_id,
            bounds.min().x,
            bounds.min().y,
            bounds.min().z,
            bounds.max().x,
            bounds.max().y,
            bounds.max().z,
            now,
        ],
    )?;
    Ok(())
}

struct QueuedUpdate {
    seq: i64,
    kind: String,
    a: Point3,
    b: Point3,
}

impl SqliteStore {
    pub fn pending_spatial_updates(&self, project_id: i64) -> Result<i64, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM spatial_updates WHERE project_id=?1",
            params![project_id],
            |row| row.get(0),
        )?)
    }

    /// Drains up to `batch` queued updates, marking dirty cells in every grid
    /// cache of the project. Draining with no grids provisioned simply
    /// discards the queue entries.
    pub fn process_spatial_updates(
        &mut self,
        project_id: i64,
        batch: usize,
    ) -> Result<SpatialDrainReport, StoreError> {
        if batch == 0 {
            return Err(StoreError::InvalidInput("batch must be positive"));
        }
        let now = now_ms();
        let tx = self.mutation_tx()?;

        let mut stmt = tx.prepare(
            "SELECT seq, kind, ax, ay, az, bx, by, bz FROM spatial_updates \
             WHERE project_id=?1 ORDER BY seq LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![project_id, batch as i64])?;
        let mut updates = Vec::new();
        while let Some(row) = rows.next()? {
            updates.push(QueuedUpdate {
                seq: row.get(0)?,
                kind: row.get(1)?,
                a: Point3::new(row.get(2)?, row.get(3)?, row.get(4)?),
                b: Point3::new(row.get(5)?, row.get(6)?, row.get(7)?),
            });
        }
        drop(rows);
        drop(stmt);

        if updates.is_empty() {
            tx.commit()?;
            return Ok(SpatialDrainReport {
                updates_drained: 0,
                cells_marked: 0,
            });
        }

        let grids = super::cache::grid_configs_for_project_tx(&tx, project_id)?;
        let mut cells_marked = 0usize;
        for grid in &grids {
            for update in &updates {
                let cells = match update.kind.as_str() {
                    "point" => vec![grid.spec.cell_of(update.a)],
                    "segment" => grid.spec.cells_for_segment(update.a, update.b),
                    _ => {
                        let min = Point3::new(
                            update.a.x.min(update.b.x),
                            update.a.y.min(update.b.y),
                            update.a.z.min(update.b.z),
                        );
                        let max = Point3::new(
                            update.a.x.max(update.b.x),
                            update.a.y.max(update.b.y),
                            update.a.z.max(update.b.z),
                        );
                        match Aabb::try_new(min, max) {
                            Ok(bounds) => grid.spec.cells_in_box(&bounds),
                            Err(_) => Vec::new(),
                        }
                    }
                };
                for cell in cells {
                    let inserted = tx.execute(
                        "INSERT INTO dirty_cells(grid_id, cx, cy, cz, marked_at_ms) \
                         VALUES (?1, ?2, ?3, ?4, ?5) \
                         ON CONFLICT(grid_id, cx, cy, cz) \
                         DO UPDATE SET marked_at_ms=excluded.marked_at_ms",
                        params![grid.id, cell.x, cell.y, cell.z, now],
                    )?;
                    cells_marked += inserted;
                }
            }
        }

        let sql = format!(
            "DELETE FROM spatial_updates WHERE seq IN ({})",
            sql_placeholders(updates.len())
        );
        let seqs: Vec<SqlValue> = updates
            .iter()
            .map(|update| SqlValue::Integer(update.seq))
            .collect();
        tx.execute(&sql, params_from_iter(seqs.iter()))?;

        tx.commit()?;
        Ok(SpatialDrainReport {
            updates_drained: updates.len(),
            cells_marked,
        })
    }
}
