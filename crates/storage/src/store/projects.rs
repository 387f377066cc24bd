#![forbid(unsafe_code)]

use super::{SqliteStore, StoreError, now_ms, validate_project_user};
use nr_core::model::Role;
use rusqlite::{OptionalExtension, params};

impl SqliteStore {
    pub fn create_project(&mut self, title: &str) -> Result<i64, StoreError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(StoreError::InvalidInput("project title must not be empty"));
        }
        let tx = self.mutation_tx()?;
        tx.execute(
            "INSERT INTO projects(title, created_at_ms) VALUES (?1, ?2)",
            params![title, now_ms()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Operational tooling entry: deployments gate access to this call
    /// itself, so it performs no permission self-check.
    pub fn grant_project_role(
        &mut self,
        project_id: i64,
        user_id: i64,
        role: Role,
    ) -> Result<(), StoreError> {
        validate_project_user(project_id, user_id)?;
        let tx = self.mutation_tx()?;
        let present: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM projects WHERE id=?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        if present.is_none() {
            return Err(StoreError::UnknownProject { project_id });
        }
        tx.execute(
            "INSERT INTO project_roles(project_id, user_id, role) VALUES (?1, ?2, ?3) \
             ON CONFLICT(project_id, user_id) DO UPDATE SET role=excluded.role",
            params![project_id, user_id, role.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn revoke_project_role(
        &mut self,
        project_id: i64,
        user_id: i64,
    ) -> Result<bool, StoreError> {
        validate_project_user(project_id, user_id)?;
        let tx = self.mutation_tx()?;
        let removed = tx.execute(
            "DELETE FROM project_roles WHERE project_id=?1 AND user_id=?2",
            params![project_id, user_id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }
}
