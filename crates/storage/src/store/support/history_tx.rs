#![forbid(unsafe_code)]

//! History shadow rows. The split mirrors the two-trigger design the data
//! model calls for: live rows get a cheap per-row txid stamp on every write,
//! while shadow copies are bulk-inserted per statement from the old row set,
//! which stays affordable on very large tables.

use super::sql_placeholders;
use crate::store::{StoreError, next_counter_tx};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};

/// Per-mutation history context, computed once at the top of the transaction.
#[derive(Clone, Copy, Debug)]
pub(in crate::store) struct HistoryStamp {
    pub enabled: bool,
    pub txid: i64,
    pub now_ms: i64,
}

pub(in crate::store) fn begin_history_tx(
    conn: &Connection,
    now_ms: i64,
) -> Result<HistoryStamp, StoreError> {
    let enabled: String = conn.query_row(
        "SELECT value FROM meta WHERE key='history_tracking'",
        [],
        |row| row.get(0),
    )?;
    let txid = next_counter_tx(conn, "txid")?;
    Ok(HistoryStamp {
        enabled: enabled == "on",
        txid,
        now_ms,
    })
}

/// Copies the current version of the given treenodes into the shadow table.
/// Validity runs from the row's own edition stamp to "now".
pub(in crate::store) fn shadow_treenodes_tx(
    conn: &Connection,
    stamp: &HistoryStamp,
    node_ids: &[i64],
) -> Result<(), StoreError> {
    if !stamp.enabled || node_ids.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "INSERT INTO treenodes_history(id, project_id, skeleton_id, parent_id, x, y, z, \
         radius, confidence, user_id, editor_id, creation_time_ms, edition_time_ms, \
         reviewer_id, review_time_ms, valid_from_ms, valid_to_ms, txid) \
         SELECT id, project_id, skeleton_id, parent_id, x, y, z, radius, confidence, \
         user_id, editor_id, creation_time_ms, edition_time_ms, reviewer_id, \
         review_time_ms, edition_time_ms, ?, ? FROM treenodes WHERE id IN ({})",
        sql_placeholders(node_ids.len())
    );
    let mut values = vec![SqlValue::Integer(stamp.now_ms), SqlValue::Integer(stamp.txid)];
    values.extend(node_ids.iter().map(|id| SqlValue::Integer(*id)));
    conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}

pub(in crate::store) fn shadow_connectors_tx(
    conn: &Connection,
    stamp: &HistoryStamp,
    connector_ids: &[i64],
) -> Result<(), StoreError> {
    if !stamp.enabled || connector_ids.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "INSERT INTO connectors_history(id, project_id, x, y, z, confidence, user_id, \
         editor_id, creation_time_ms, edition_time_ms, valid_from_ms, valid_to_ms, txid) \
         SELECT id, project_id, x, y, z, confidence, user_id, editor_id, \
         creation_time_ms, edition_time_ms, edition_time_ms, ?, ? \
         FROM connectors WHERE id IN ({})",
        sql_placeholders(connector_ids.len())
    );
    let mut values = vec![SqlValue::Integer(stamp.now_ms), SqlValue::Integer(stamp.txid)];
    values.extend(connector_ids.iter().map(|id| SqlValue::Integer(*id)));
    conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}

pub(in crate::store) fn shadow_links_tx(
    conn: &Connection,
    stamp: &HistoryStamp,
    link_ids: &[i64],
) -> Result<(), StoreError> {
    if !stamp.enabled || link_ids.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "INSERT INTO treenode_connectors_history(id, project_id, treenode_id, connector_id, \
         relation, confidence, user_id, creation_time_ms, edition_time_ms, \
         valid_from_ms, valid_to_ms, txid) \
         SELECT id, project_id, treenode_id, connector_id, relation, confidence, user_id, \
         creation_time_ms, edition_time_ms, edition_time_ms, ?, ? \
         FROM treenode_connectors WHERE id IN ({})",
        sql_placeholders(link_ids.len())
    );
    let mut values = vec![SqlValue::Integer(stamp.now_ms), SqlValue::Integer(stamp.txid)];
    values.extend(link_ids.iter().map(|id| SqlValue::Integer(*id)));
    conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(())
}
