#![forbid(unsafe_code)]

use crate::store::StoreError;
use nr_core::model::Role;
use rusqlite::{Connection, OptionalExtension, params};

/// Permission gate. Runs before any state check so an unauthorized caller
/// learns nothing about row staleness.
pub(in crate::store) fn require_role_tx(
    conn: &Connection,
    project_id: i64,
    user_id: i64,
    required: Role,
) -> Result<(), StoreError> {
    let project: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM projects WHERE id=?1",
            params![project_id],
            |row| row.get(0),
        )
        .optional()?;
    if project.is_none() {
        return Err(StoreError::UnknownProject { project_id });
    }

    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM project_roles WHERE project_id=?1 AND user_id=?2",
            params![project_id, user_id],
            |row| row.get(0),
        )
        .optional()?;
    let granted = role
        .as_deref()
        .map(Role::try_parse)
        .transpose()
        .map_err(|err| StoreError::InvalidInput(err.message()))?;

    match granted {
        Some(granted) if granted.covers(required) => Ok(()),
        _ => Err(StoreError::PermissionDenied {
            user_id,
            project_id,
            required: required.as_str(),
        }),
    }
}
