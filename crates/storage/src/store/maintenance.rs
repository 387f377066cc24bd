#![forbid(unsafe_code)]

//! Offline repair of the materialized edge tables. The incremental updates
//! keep them consistent in normal operation; a rebuild exists for recovery
//! after manual surgery and as the oracle the consistency tests compare
//! against.

use super::support::{edges_tx, state_tx};
use super::{EdgeRebuildReport, SqliteStore, StoreError};
use rusqlite::params;

impl SqliteStore {
    /// Drops and recomputes every materialized edge of the project.
    pub fn rebuild_edges(&mut self, project_id: i64) -> Result<EdgeRebuildReport, StoreError> {
        let tx = self.mutation_tx()?;

        let treenode_edges_before: i64 = tx.query_row(
            "SELECT COUNT(*) FROM treenode_edges WHERE project_id=?1",
            params![project_id],
            |row| row.get(0),
        )?;
        let connector_edges_before: i64 = tx.query_row(
            "SELECT COUNT(*) FROM connector_edges WHERE project_id=?1",
            params![project_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "DELETE FROM treenode_edges WHERE project_id=?1",
            params![project_id],
        )?;
        tx.execute(
            "DELETE FROM connector_edges WHERE project_id=?1",
            params![project_id],
        )?;

        let mut stmt =
            tx.prepare("SELECT id FROM treenodes WHERE project_id=?1 ORDER BY id")?;
        let mut rows = stmt.query(params![project_id])?;
        let mut node_ids = Vec::new();
        while let Some(row) = rows.next()? {
            node_ids.push(row.get::<_, i64>(0)?);
        }
        drop(rows);
        drop(stmt);
        for node_id in node_ids {
            edges_tx::refresh_treenode_edge_tx(&tx, project_id, node_id)?;
        }

        let mut stmt = tx.prepare(
            "SELECT id, treenode_id, connector_id FROM treenode_connectors \
             WHERE project_id=?1 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![project_id])?;
        let mut links = Vec::new();
        while let Some(row) = rows.next()? {
            links.push((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ));
        }
        drop(rows);
        drop(stmt);
        for (link_id, treenode_id, connector_id) in links {
            let node = state_tx::get_node_tx(&tx, project_id, treenode_id)?;
            let connector = state_tx::get_connector_tx(&tx, project_id, connector_id)?;
            edges_tx::upsert_connector_edge_tx(
                &tx,
                link_id,
                project_id,
                treenode_id,
                connector_id,
                node.location(),
                connector.location(),
            )?;
        }

        let treenode_edges_after: i64 = tx.query_row(
            "SELECT COUNT(*) FROM treenode_edges WHERE project_id=?1",
            params![project_id],
            |row| row.get(0),
        )?;
        let connector_edges_after: i64 = tx.query_row(
            "SELECT COUNT(*) FROM connector_edges WHERE project_id=?1",
            params![project_id],
            |row| row.get(0),
        )?;

        tx.commit()?;
        Ok(EdgeRebuildReport {
            treenode_edges_before,
            treenode_edges_after,
            connector_edges_before,
            connector_edges_after,
        })
    }

    /// Recomputes edges for the named skeletons and/or connectors only.
    /// Skeleton ids refresh every node edge plus the link edges of those
    /// nodes; connector ids refresh every link edge of the connector, which
    /// covers links whose nodes live in skeletons not named here. Returns the
    /// number of refreshed entities.
    pub fn rebuild_selected_edges(
        &mut self,
        project_id: i64,
        skeleton_ids: &[i64],
        connector_ids: &[i64],
    ) -> Result<usize, StoreError> {
        if skeleton_ids.is_empty() && connector_ids.is_empty() {
            return Err(StoreError::InvalidInput(
                "at least one skeleton or connector id is required",
            ));
        }
        let tx = self.mutation_tx()?;
        let mut rebuilt = 0usize;

        for &skeleton_id in skeleton_ids {
            let mut stmt = tx.prepare(
                "SELECT id FROM treenodes WHERE project_id=?1 AND skeleton_id=?2 ORDER BY id",
            )?;
            let mut rows = stmt.query(params![project_id, skeleton_id])?;
            let mut node_ids = Vec::new();
            while let Some(row) = rows.next()? {
                node_ids.push(row.get::<_, i64>(0)?);
            }
            drop(rows);
            drop(stmt);
            if node_ids.is_empty() {
                return Err(StoreError::UnknownSkeleton { skeleton_id });
            }
            for node_id in &node_ids {
                edges_tx::refresh_treenode_edge_tx(&tx, project_id, *node_id)?;
                edges_tx::refresh_link_edges_for_node_tx(&tx, project_id, *node_id)?;
            }
            rebuilt += node_ids.len();
        }

        for &connector_id in connector_ids {
            state_tx::get_connector_tx(&tx, project_id, connector_id)?;
            edges_tx::refresh_link_edges_for_connector_tx(&tx, project_id, connector_id)?;
            rebuilt += 1;
        }

        tx.commit()?;
        Ok(rebuilt)
    }
}
