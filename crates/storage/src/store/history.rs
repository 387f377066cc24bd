#![forbid(unsafe_code)]

use super::{SqliteStore, StoreError, TreenodeVersionRow};
use rusqlite::{OptionalExtension, params};

impl SqliteStore {
    pub fn history_enabled(&self) -> Result<bool, StoreError> {
        let value: String = self.conn.query_row(
            "SELECT value FROM meta WHERE key='history_tracking'",
            [],
            |row| row.get(0),
        )?;
        Ok(value == "on")
    }

    /// Idempotent; returns whether the flag actually flipped. Rows written
    /// while tracking was off have no shadow copies, so re-enabling does not
    /// backfill.
    pub fn enable_history_tracking(&mut self) -> Result<bool, StoreError> {
        self.set_history_flag("on")
    }

    pub fn disable_history_tracking(&mut self) -> Result<bool, StoreError> {
        self.set_history_flag("off")
    }

    fn set_history_flag(&mut self, target: &str) -> Result<bool, StoreError> {
        let tx = self.mutation_tx()?;
        let current: String = tx.query_row(
            "SELECT value FROM meta WHERE key='history_tracking'",
            [],
            |row| row.get(0),
        )?;
        if current == target {
            tx.commit()?;
            return Ok(false);
        }
        tx.execute(
            "UPDATE meta SET value=?1 WHERE key='history_tracking'",
            params![target],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Past versions of a node, oldest first, with the live row appended as
    /// an open-ended version. Unknown nodes with shadow rows still return
    /// those rows: a deleted node keeps its history.
    pub fn node_history(
        &self,
        project_id: i64,
        node_id: i64,
    ) -> Result<Vec<TreenodeVersionRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, skeleton_id, parent_id, x, y, z, radius, confidence, editor_id, \
             valid_from_ms, valid_to_ms, txid FROM treenodes_history \
             WHERE id=?1 AND project_id=?2 ORDER BY valid_to_ms, txid",
        )?;
        let mut rows = stmt.query(params![node_id, project_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(TreenodeVersionRow {
                node_id: row.get(0)?,
                skeleton_id: row.get(1)?,
                parent_id: row.get(2)?,
                x: row.get(3)?,
                y: row.get(4)?,
                z: row.get(5)?,
                radius: row.get(6)?,
                confidence: row.get(7)?,
                editor_id: row.get(8)?,
                valid_from_ms: row.get(9)?,
                valid_to_ms: row.get(10)?,
                txid: row.get(11)?,
            });
        }
        drop(rows);
        drop(stmt);

        let live = self
            .conn
            .query_row(
                "SELECT id, skeleton_id, parent_id, x, y, z, radius, confidence, editor_id, \
                 edition_time_ms, txid FROM treenodes WHERE id=?1 AND project_id=?2",
                params![node_id, project_id],
                |row| {
                    Ok(TreenodeVersionRow {
                        node_id: row.get(0)?,
                        skeleton_id: row.get(1)?,
                        parent_id: row.get(2)?,
                        x: row.get(3)?,
                        y: row.get(4)?,
                        z: row.get(5)?,
                        radius: row.get(6)?,
                        confidence: row.get(7)?,
                        editor_id: row.get(8)?,
                        valid_from_ms: row.get(9)?,
                        valid_to_ms: i64::MAX,
                        txid: row.get(10)?,
                    })
                },
            )
            .optional()?;
        if let Some(live) = live {
            out.push(live);
        }

        if out.is_empty() {
            return Err(StoreError::UnknownNode { node_id });
        }
        Ok(out)
    }

    /// Drops shadow rows that stopped being valid before the cutoff. Returns
    /// how many rows were removed across all three shadow tables.
    pub fn truncate_history(&mut self, before_ms: i64) -> Result<usize, StoreError> {
        let tx = self.mutation_tx()?;
        let mut removed = 0usize;
        for table in [
            "treenodes_history",
            "connectors_history",
            "treenode_connectors_history",
        ] {
            let sql = format!("DELETE FROM {table} WHERE valid_to_ms < ?1");
            removed += tx.execute(&sql, params![before_ms])?;
        }
        tx.commit()?;
        Ok(removed)
    }
}
