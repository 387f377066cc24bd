#![forbid(unsafe_code)]

//! Skeleton summaries are maintained incrementally: every mutation applies an
//! exact delta inside its own transaction, so the table is always consistent
//! with the live node set without ever walking a whole skeleton on the hot
//! path. A full rebuild exists for recovery and for testing the deltas.

use super::{SkeletonSummaryRow, SqliteStore, StoreError, SummaryRebuildReport};
use rusqlite::{Connection, OptionalExtension, params};

pub(in crate::store) fn create_summary_tx(
    conn: &Connection,
    project_id: i64,
    skeleton_id: i64,
    user_id: i64,
    now: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO skeleton_summaries(skeleton_id, project_id, node_count, cable_length, \
         last_edit_ms, last_editor_id) VALUES (?1, ?2, 1, 0.0, ?3, ?4)",
        params![skeleton_id, project_id, now, user_id],
    )?;
    Ok(())
}

/// Applies an exact node-count and cable-length delta. The summary row is
/// created on demand and removed once its skeleton has no nodes left.
pub(in crate::store) fn apply_summary_delta_tx(
    conn: &Connection,
    project_id: i64,
    skeleton_id: i64,
    node_delta: i64,
    cable_delta: f64,
    user_id: i64,
    now: i64,
) -> Result<(), StoreError> {
    let updated = conn.execute(
        "UPDATE skeleton_summaries SET \
         node_count = node_count + ?1, \
         cable_length = MAX(0.0, cable_length + ?2), \
         last_edit_ms = MAX(last_edit_ms, ?3), \
         last_editor_id = ?4 \
         WHERE skeleton_id=?5 AND project_id=?6",
        params![node_delta, cable_delta, now, user_id, skeleton_id, project_id],
    )?;
    if updated == 0 {
        if node_delta <= 0 {
            return Ok(());
        }
        conn.execute(
            "INSERT INTO skeleton_summaries(skeleton_id, project_id, node_count, \
             cable_length, last_edit_ms, last_editor_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                skeleton_id,
                project_id,
                node_delta,
                cable_delta.max(0.0),
                now,
                user_id
            ],
        )?;
        return Ok(());
    }
    conn.execute(
        "DELETE FROM skeleton_summaries WHERE skeleton_id=?1 AND project_id=?2 \
         AND node_count <= 0",
        params![skeleton_id, project_id],
    )?;
    Ok(())
}

impl SqliteStore {
    pub fn skeleton_summary(
        &self,
        project_id: i64,
        skeleton_id: i64,
    ) -> Result<SkeletonSummaryRow, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT skeleton_id, project_id, node_count, cable_length, last_edit_ms, \
                 last_editor_id FROM skeleton_summaries \
                 WHERE project_id=?1 AND skeleton_id=?2",
                params![project_id, skeleton_id],
                read_summary_row,
            )
            .optional()?;
        row.ok_or(StoreError::UnknownSkeleton { skeleton_id })
    }

    pub fn list_skeleton_summaries(
        &self,
        project_id: i64,
    ) -> Result<Vec<SkeletonSummaryRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT skeleton_id, project_id, node_count, cable_length, last_edit_ms, \
             last_editor_id FROM skeleton_summaries WHERE project_id=?1 \
             ORDER BY skeleton_id",
        )?;
        let mut rows = stmt.query(params![project_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_summary_row(row)?);
        }
        Ok(out)
    }

    /// Recomputes every summary of the project from the live node and edge
    /// tables. Preserves last-edit attribution by taking the latest edition
    /// stamp and its editor from the nodes themselves.
    pub fn rebuild_skeleton_summaries(
        &mut self,
        project_id: i64,
    ) -> Result<SummaryRebuildReport, StoreError> {
        let tx = self.mutation_tx()?;

        let before: i64 = tx.query_row(
            "SELECT COUNT(*) FROM skeleton_summaries WHERE project_id=?1",
            params![project_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "DELETE FROM skeleton_summaries WHERE project_id=?1",
            params![project_id],
        )?;

        // Cable length is the sum of parent-edge lengths, which is exactly
        // what the materialized treenode edges hold (roots contribute their
        // degenerate zero-length edge).
        tx.execute(
            "INSERT INTO skeleton_summaries(skeleton_id, project_id, node_count, \
             cable_length, last_edit_ms, last_editor_id) \
             SELECT t.skeleton_id, t.project_id, COUNT(*), \
             COALESCE(SUM(CASE WHEN e.treenode_id IS NULL THEN 0.0 ELSE \
             sqrt((e.x1-e.x2)*(e.x1-e.x2) + (e.y1-e.y2)*(e.y1-e.y2) + \
             (e.z1-e.z2)*(e.z1-e.z2)) END), 0.0), \
             MAX(t.edition_time_ms), \
             (SELECT editor_id FROM treenodes x WHERE x.skeleton_id = t.skeleton_id \
              AND x.project_id = t.project_id ORDER BY x.edition_time_ms DESC, x.id DESC \
              LIMIT 1) \
             FROM treenodes t LEFT JOIN treenode_edges e ON e.treenode_id = t.id \
             WHERE t.project_id=?1 GROUP BY t.skeleton_id",
            params![project_id],
        )?;

        let after: i64 = tx.query_row(
            "SELECT COUNT(*) FROM skeleton_summaries WHERE project_id=?1",
            params![project_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(SummaryRebuildReport {
            summaries_before: before,
            summaries_after: after,
        })
    }
}

fn read_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SkeletonSummaryRow> {
    Ok(SkeletonSummaryRow {
        skeleton_id: row.get(0)?,
        project_id: row.get(1)?,
        node_count: row.get(2)?,
        cable_length: row.get(3)?,
        last_edit_ms: row.get(4)?,
        last_editor_id: row.get(5)?,
    })
}
