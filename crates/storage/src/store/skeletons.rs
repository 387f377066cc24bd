#![forbid(unsafe_code)]

use super::support::{edges_tx, history_tx, perm_tx, sql_placeholders, state_tx};
use super::{
    JoinSkeletonsRequest, SplitSkeletonRequest, SqliteStore, StoreError, bumped_edition,
    next_counter_tx, now_ms, spatial_update, summary, validate_project_user,
};
use nr_core::geom::{Aabb, Point3};
use nr_core::model::Role;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};

impl SqliteStore {
    /// Detaches the subtree rooted at the given node into a fresh skeleton.
    /// The node becomes the new skeleton's root; the cable of the cut edge
    /// stays with the original skeleton. Returns the pair of skeleton ids,
    /// original first.
    pub fn split_skeleton(
        &mut self,
        request: SplitSkeletonRequest,
    ) -> Result<(i64, i64), StoreError> {
        validate_project_user(request.project_id, request.user_id)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        state_tx::check_state_tx(&tx, request.project_id, request.node_id, &request.state)?;

        let node = state_tx::get_node_tx(&tx, request.project_id, request.node_id)?;
        let parent_id = node.parent_id.ok_or(StoreError::StructuralViolation {
            node_id: node.id,
            constraint: "splitting at a root detaches nothing",
        })?;
        let parent = state_tx::get_node_tx(&tx, request.project_id, parent_id)?;

        let subtree = state_tx::subtree_ids_tx(&tx, node.id)?;
        let stamp = history_tx::begin_history_tx(&tx, now)?;
        history_tx::shadow_treenodes_tx(&tx, &stamp, &subtree)?;

        let new_skeleton_id = next_counter_tx(&tx, "skeleton")?;
        let sql = format!(
            "UPDATE treenodes SET skeleton_id=?, txid=? WHERE id IN ({})",
            sql_placeholders(subtree.len())
        );
        let mut values = vec![
            SqlValue::Integer(new_skeleton_id),
            SqlValue::Integer(stamp.txid),
        ];
        values.extend(subtree.iter().map(|id| SqlValue::Integer(*id)));
        tx.execute(&sql, params_from_iter(values.iter()))?;

        tx.execute(
            "UPDATE treenodes SET parent_id=NULL, editor_id=?1, edition_time_ms=?2 \
             WHERE id=?3",
            params![
                request.user_id,
                bumped_edition(node.edition_time_ms, now),
                node.id,
            ],
        )?;
        edges_tx::refresh_treenode_edge_tx(&tx, request.project_id, node.id)?;

        // With the detached node's edge now degenerate, summing the subtree's
        // materialized edges yields exactly the cable that moves over.
        let moved_cable = edge_cable_sum_tx(&tx, &subtree)?;
        let cut_cable = node.location().distance(parent.location());
        let moved_count = subtree.len() as i64;

        summary::apply_summary_delta_tx(
            &tx,
            request.project_id,
            node.skeleton_id,
            -moved_count,
            -(moved_cable + cut_cable),
            request.user_id,
            now,
        )?;
        summary::apply_summary_delta_tx(
            &tx,
            request.project_id,
            new_skeleton_id,
            moved_count,
            moved_cable,
            request.user_id,
            now,
        )?;

        let mut bounds = Aabb::of_segment(node.location(), parent.location());
        if let Some(subtree_bounds) = edge_bounds_tx(&tx, &subtree)? {
            bounds = bounds.union(&subtree_bounds);
        }
        spatial_update::enqueue_box_tx(&tx, request.project_id, &bounds, now)?;

        tx.commit()?;
        Ok((node.skeleton_id, new_skeleton_id))
    }

    /// Merges the skeleton containing `to_node_id` into the one containing
    /// `from_node_id`. The absorbed skeleton is rerooted at `to_node_id`,
    /// which is then attached as a child of `from_node_id`; the absorbed
    /// summary row disappears. Returns the surviving skeleton id.
    pub fn join_skeletons(&mut self, request: JoinSkeletonsRequest) -> Result<i64, StoreError> {
        validate_project_user(request.project_id, request.user_id)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        state_tx::check_state_tx(
            &tx,
            request.project_id,
            request.from_node_id,
            &request.from_state,
        )?;
        state_tx::check_state_tx(
            &tx,
            request.project_id,
            request.to_node_id,
            &request.to_state,
        )?;

        let from = state_tx::get_node_tx(&tx, request.project_id, request.from_node_id)?;
        let to = state_tx::get_node_tx(&tx, request.project_id, request.to_node_id)?;
        if from.skeleton_id == to.skeleton_id {
            return Err(StoreError::StructuralViolation {
                node_id: to.id,
                constraint: "both nodes are already in the same skeleton",
            });
        }

        let mut stmt = tx.prepare(
            "SELECT id FROM treenodes WHERE project_id=?1 AND skeleton_id=?2 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![request.project_id, to.skeleton_id])?;
        let mut absorbed = Vec::new();
        while let Some(row) = rows.next()? {
            absorbed.push(row.get::<_, i64>(0)?);
        }
        drop(rows);
        drop(stmt);

        let absorbed_cable = edge_cable_sum_tx(&tx, &absorbed)?;
        let absorbed_bounds = edge_bounds_tx(&tx, &absorbed)?;
        let absorbed_count = absorbed.len() as i64;

        let stamp = history_tx::begin_history_tx(&tx, now)?;
        history_tx::shadow_treenodes_tx(&tx, &stamp, &absorbed)?;

        // Reroot at the attachment point by reversing the parent pointers
        // along its ancestor chain.
        let chain = state_tx::ancestor_chain_tx(&tx, request.project_id, to.id)?;
        let mut new_parent = Some(from.id);
        for &chain_id in &chain {
            let current = state_tx::get_node_tx(&tx, request.project_id, chain_id)?;
            let next_parent = current.parent_id;
            tx.execute(
                "UPDATE treenodes SET parent_id=?1, editor_id=?2, edition_time_ms=?3 \
                 WHERE id=?4",
                params![
                    new_parent,
                    request.user_id,
                    bumped_edition(current.edition_time_ms, now),
                    chain_id,
                ],
            )?;
            new_parent = Some(chain_id);
            if next_parent.is_none() {
                break;
            }
        }

        let sql = format!(
            "UPDATE treenodes SET skeleton_id=?, txid=? WHERE id IN ({})",
            sql_placeholders(absorbed.len())
        );
        let mut values = vec![
            SqlValue::Integer(from.skeleton_id),
            SqlValue::Integer(stamp.txid),
        ];
        values.extend(absorbed.iter().map(|id| SqlValue::Integer(*id)));
        tx.execute(&sql, params_from_iter(values.iter()))?;

        for &chain_id in &chain {
            edges_tx::refresh_treenode_edge_tx(&tx, request.project_id, chain_id)?;
        }

        let bridge_cable = to.location().distance(from.location());
        summary::apply_summary_delta_tx(
            &tx,
            request.project_id,
            to.skeleton_id,
            -absorbed_count,
            -absorbed_cable,
            request.user_id,
            now,
        )?;
        summary::apply_summary_delta_tx(
            &tx,
            request.project_id,
            from.skeleton_id,
            absorbed_count,
            absorbed_cable + bridge_cable,
            request.user_id,
            now,
        )?;

        let mut bounds = Aabb::of_segment(to.location(), from.location());
        if let Some(absorbed_bounds) = absorbed_bounds {
            bounds = bounds.union(&absorbed_bounds);
        }
        spatial_update::enqueue_box_tx(&tx, request.project_id, &bounds, now)?;

        tx.commit()?;
        Ok(from.skeleton_id)
    }
}

fn edge_cable_sum_tx(conn: &Connection, node_ids: &[i64]) -> Result<f64, StoreError> {
    if node_ids.is_empty() {
        return Ok(0.0);
    }
    let sql = format!(
        "SELECT COALESCE(SUM(sqrt((x1-x2)*(x1-x2) + (y1-y2)*(y1-y2) + (z1-z2)*(z1-z2))), 0.0) \
         FROM treenode_edges WHERE treenode_id IN ({})",
        sql_placeholders(node_ids.len())
    );
    let values: Vec<SqlValue> = node_ids.iter().map(|id| SqlValue::Integer(*id)).collect();
    Ok(conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?)
}

fn edge_bounds_tx(conn: &Connection, node_ids: &[i64]) -> Result<Option<Aabb>, StoreError> {
    if node_ids.is_empty() {
        return Ok(None);
    }
    let sql = format!(
        "SELECT MIN(min_x), MIN(min_y), MIN(min_z), MAX(max_x), MAX(max_y), MAX(max_z) \
         FROM treenode_edges WHERE treenode_id IN ({})",
        sql_placeholders(node_ids.len())
    );
    let values: Vec<SqlValue> = node_ids.iter().map(|id| SqlValue::Integer(*id)).collect();
    let bounds: (
        Option<f64>,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        Option<f64>,
        Option<f64>,
    ) = conn.query_row(&sql, params_from_iter(values.iter()), |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    })?;
    match bounds {
        (Some(min_x), Some(min_y), Some(min_z), Some(max_x), Some(max_y), Some(max_z)) => {
            Ok(Some(Aabb::of_segment(
                Point3::new(min_x, min_y, min_z),
                Point3::new(max_x, max_y, max_z),
            )))
        }
        _ => Ok(None),
    }
}
