#![forbid(unsafe_code)]

use super::StoreError;
use rusqlite::{Connection, OptionalExtension, params};

pub(super) const SCHEMA_VERSION: &str = "v1";

const EXPECTED_TABLES: &[&str] = &[
    "meta",
    "counters",
    "projects",
    "project_roles",
    "treenodes",
    "connectors",
    "treenode_connectors",
    "skeleton_summaries",
    "treenode_edges",
    "connector_edges",
    "node_tags",
    "node_grid_caches",
    "node_grid_cache_cells",
    "dirty_cells",
    "spatial_updates",
    "treenodes_history",
    "connectors_history",
    "treenode_connectors_history",
];

/// Fail closed on databases this build does not understand: a populated file
/// without our meta table, or a meta table carrying a different version.
pub(super) fn preflight_gate(conn: &Connection) -> Result<(), StoreError> {
    let table_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;
    if table_count == 0 {
        return Ok(());
    }

    let has_meta: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='meta'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if has_meta.is_none() {
        return Err(StoreError::InvalidInput(
            "RESET_REQUIRED: database has tables but no meta table",
        ));
    }

    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match version.as_deref() {
        Some(SCHEMA_VERSION) => Ok(()),
        _ => Err(StoreError::InvalidInput(
            "RESET_REQUIRED: unsupported schema version",
        )),
    }
}

pub(super) fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;

        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS counters (
          name TEXT PRIMARY KEY,
          value INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS projects (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          title TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS project_roles (
          project_id INTEGER NOT NULL,
          user_id INTEGER NOT NULL,
          role TEXT NOT NULL,
          PRIMARY KEY (project_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS treenodes (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          project_id INTEGER NOT NULL,
          skeleton_id INTEGER NOT NULL,
          parent_id INTEGER,
          x REAL NOT NULL,
          y REAL NOT NULL,
          z REAL NOT NULL,
          radius REAL NOT NULL DEFAULT -1.0,
          confidence INTEGER NOT NULL DEFAULT 5,
          user_id INTEGER NOT NULL,
          editor_id INTEGER NOT NULL,
          creation_time_ms INTEGER NOT NULL,
          edition_time_ms INTEGER NOT NULL,
          reviewer_id INTEGER,
          review_time_ms INTEGER,
          txid INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_treenodes_skeleton
          ON treenodes(project_id, skeleton_id);
        CREATE INDEX IF NOT EXISTS idx_treenodes_parent
          ON treenodes(parent_id);

        CREATE TABLE IF NOT EXISTS connectors (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          project_id INTEGER NOT NULL,
          x REAL NOT NULL,
          y REAL NOT NULL,
          z REAL NOT NULL,
          confidence INTEGER NOT NULL DEFAULT 5,
          user_id INTEGER NOT NULL,
          editor_id INTEGER NOT NULL,
          creation_time_ms INTEGER NOT NULL,
          edition_time_ms INTEGER NOT NULL,
          txid INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_connectors_location
          ON connectors(project_id, z, x, y);

        CREATE TABLE IF NOT EXISTS treenode_connectors (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          project_id INTEGER NOT NULL,
          treenode_id INTEGER NOT NULL,
          connector_id INTEGER NOT NULL,
          relation TEXT NOT NULL,
          confidence INTEGER NOT NULL DEFAULT 5,
          user_id INTEGER NOT NULL,
          creation_time_ms INTEGER NOT NULL,
          edition_time_ms INTEGER NOT NULL,
          txid INTEGER NOT NULL DEFAULT 0,
          UNIQUE (project_id, treenode_id, connector_id, relation)
        );
        CREATE INDEX IF NOT EXISTS idx_links_connector
          ON treenode_connectors(connector_id);
        CREATE INDEX IF NOT EXISTS idx_links_treenode
          ON treenode_connectors(treenode_id);

        CREATE TABLE IF NOT EXISTS skeleton_summaries (
          skeleton_id INTEGER PRIMARY KEY,
          project_id INTEGER NOT NULL,
          node_count INTEGER NOT NULL,
          cable_length REAL NOT NULL,
          last_edit_ms INTEGER NOT NULL,
          last_editor_id INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_summaries_project
          ON skeleton_summaries(project_id);

        CREATE TABLE IF NOT EXISTS treenode_edges (
          treenode_id INTEGER PRIMARY KEY,
          project_id INTEGER NOT NULL,
          x1 REAL NOT NULL, y1 REAL NOT NULL, z1 REAL NOT NULL,
          x2 REAL NOT NULL, y2 REAL NOT NULL, z2 REAL NOT NULL,
          min_x REAL NOT NULL, min_y REAL NOT NULL, min_z REAL NOT NULL,
          max_x REAL NOT NULL, max_y REAL NOT NULL, max_z REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_treenode_edges_bounds
          ON treenode_edges(project_id, min_z, max_z, min_x, max_x, min_y, max_y);

        CREATE TABLE IF NOT EXISTS connector_edges (
          link_id INTEGER PRIMARY KEY,
          project_id INTEGER NOT NULL,
          treenode_id INTEGER NOT NULL,
          connector_id INTEGER NOT NULL,
          x1 REAL NOT NULL, y1 REAL NOT NULL, z1 REAL NOT NULL,
          x2 REAL NOT NULL, y2 REAL NOT NULL, z2 REAL NOT NULL,
          min_x REAL NOT NULL, min_y REAL NOT NULL, min_z REAL NOT NULL,
          max_x REAL NOT NULL, max_y REAL NOT NULL, max_z REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_connector_edges_bounds
          ON connector_edges(project_id, min_z, max_z, min_x, max_x, min_y, max_y);
        CREATE INDEX IF NOT EXISTS idx_connector_edges_connector
          ON connector_edges(connector_id);
        CREATE INDEX IF NOT EXISTS idx_connector_edges_treenode
          ON connector_edges(treenode_id);

        CREATE TABLE IF NOT EXISTS node_tags (
          project_id INTEGER NOT NULL,
          treenode_id INTEGER NOT NULL,
          tag TEXT NOT NULL,
          user_id INTEGER NOT NULL,
          created_at_ms INTEGER NOT NULL,
          PRIMARY KEY (project_id, treenode_id, tag)
        );

        CREATE TABLE IF NOT EXISTS node_grid_caches (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          project_id INTEGER NOT NULL,
          orientation TEXT NOT NULL,
          cell_width REAL NOT NULL,
          cell_height REAL NOT NULL,
          cell_depth REAL NOT NULL,
          lod_levels INTEGER NOT NULL DEFAULT 1,
          created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS node_grid_cache_cells (
          grid_id INTEGER NOT NULL,
          cx INTEGER NOT NULL,
          cy INTEGER NOT NULL,
          cz INTEGER NOT NULL,
          payload_json TEXT NOT NULL,
          checksum TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          PRIMARY KEY (grid_id, cx, cy, cz)
        );

        CREATE TABLE IF NOT EXISTS dirty_cells (
          grid_id INTEGER NOT NULL,
          cx INTEGER NOT NULL,
          cy INTEGER NOT NULL,
          cz INTEGER NOT NULL,
          marked_at_ms INTEGER NOT NULL,
          PRIMARY KEY (grid_id, cx, cy, cz)
        );

        CREATE TABLE IF NOT EXISTS spatial_updates (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          project_id INTEGER NOT NULL,
          kind TEXT NOT NULL,
          ax REAL NOT NULL, ay REAL NOT NULL, az REAL NOT NULL,
          bx REAL NOT NULL, by REAL NOT NULL, bz REAL NOT NULL,
          ts_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS treenodes_history (
          id INTEGER NOT NULL,
          project_id INTEGER NOT NULL,
          skeleton_id INTEGER NOT NULL,
          parent_id INTEGER,
          x REAL NOT NULL, y REAL NOT NULL, z REAL NOT NULL,
          radius REAL NOT NULL,
          confidence INTEGER NOT NULL,
          user_id INTEGER NOT NULL,
          editor_id INTEGER NOT NULL,
          creation_time_ms INTEGER NOT NULL,
          edition_time_ms INTEGER NOT NULL,
          reviewer_id INTEGER,
          review_time_ms INTEGER,
          valid_from_ms INTEGER NOT NULL,
          valid_to_ms INTEGER NOT NULL,
          txid INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_treenodes_history_id
          ON treenodes_history(id, valid_to_ms);

        CREATE TABLE IF NOT EXISTS connectors_history (
          id INTEGER NOT NULL,
          project_id INTEGER NOT NULL,
          x REAL NOT NULL, y REAL NOT NULL, z REAL NOT NULL,
          confidence INTEGER NOT NULL,
          user_id INTEGER NOT NULL,
          editor_id INTEGER NOT NULL,
          creation_time_ms INTEGER NOT NULL,
          edition_time_ms INTEGER NOT NULL,
          valid_from_ms INTEGER NOT NULL,
          valid_to_ms INTEGER NOT NULL,
          txid INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_connectors_history_id
          ON connectors_history(id, valid_to_ms);

        CREATE TABLE IF NOT EXISTS treenode_connectors_history (
          id INTEGER NOT NULL,
          project_id INTEGER NOT NULL,
          treenode_id INTEGER NOT NULL,
          connector_id INTEGER NOT NULL,
          relation TEXT NOT NULL,
          confidence INTEGER NOT NULL,
          user_id INTEGER NOT NULL,
          creation_time_ms INTEGER NOT NULL,
          edition_time_ms INTEGER NOT NULL,
          valid_from_ms INTEGER NOT NULL,
          valid_to_ms INTEGER NOT NULL,
          txid INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_links_history_id
          ON treenode_connectors_history(id, valid_to_ms);
        "#,
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES ('history_tracking', 'off')",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO counters(name, value) VALUES ('skeleton', 0)",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO counters(name, value) VALUES ('txid', 0)",
        [],
    )?;
    Ok(())
}

pub(super) fn expected_tables() -> &'static [&'static str] {
    EXPECTED_TABLES
}
