#![forbid(unsafe_code)]

use super::support::{edges_tx, history_tx, perm_tx, state_tx};
use super::{
    SqliteStore, StoreError, bumped_edition, now_ms, spatial_update, summary, validate_confidence,
    validate_project_user, validate_radius,
};
use super::{
    AddNodeTagRequest, CreateTreenodeRequest, DeleteTreenodeRequest, MarkReviewedRequest,
    MoveTreenodeRequest, RemoveNodeTagRequest, ReparentTreenodeRequest, TreenodeRow,
    UpdateConfidenceRequest, UpdateRadiusRequest,
};
use nr_core::geom::Aabb;
use nr_core::model::Role;
use rusqlite::{OptionalExtension, params};

impl SqliteStore {
    /// Creates a root (fresh skeleton) or a child node. For children the
    /// state descriptor is checked against the parent.
    pub fn create_treenode(
        &mut self,
        request: CreateTreenodeRequest,
    ) -> Result<i64, StoreError> {
        validate_project_user(request.project_id, request.user_id)?;
        let confidence = validate_confidence(request.confidence)?;
        let radius = validate_radius(request.radius)?;
        let location = super::finite_point(request.location)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        let stamp = history_tx::begin_history_tx(&tx, now)?;

        let node_id = match request.parent_id {
            None => {
                let skeleton_id = super::next_counter_tx(&tx, "skeleton")?;
                tx.execute(
                    "INSERT INTO treenodes(project_id, skeleton_id, parent_id, x, y, z, \
                     radius, confidence, user_id, editor_id, creation_time_ms, \
                     edition_time_ms, txid) \
                     VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9, ?9, ?10)",
                    params![
                        request.project_id,
                        skeleton_id,
                        location.x,
                        location.y,
                        location.z,
                        radius,
                        confidence,
                        request.user_id,
                        now,
                        stamp.txid,
                    ],
                )?;
                let node_id = tx.last_insert_rowid();
                let node = state_tx::get_node_tx(&tx, request.project_id, node_id)?;
                edges_tx::upsert_treenode_edge_tx(&tx, &node, None)?;
                summary::create_summary_tx(
                    &tx,
                    request.project_id,
                    skeleton_id,
                    request.user_id,
                    now,
                )?;
                spatial_update::enqueue_point_tx(&tx, request.project_id, location, now)?;
                node_id
            }
            Some(parent_id) => {
                state_tx::check_state_tx(&tx, request.project_id, parent_id, &request.state)?;
                let parent = state_tx::get_node_tx(&tx, request.project_id, parent_id)?;
                tx.execute(
                    "INSERT INTO treenodes(project_id, skeleton_id, parent_id, x, y, z, \
                     radius, confidence, user_id, editor_id, creation_time_ms, \
                     edition_time_ms, txid) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?10, ?10, ?11)",
                    params![
                        request.project_id,
                        parent.skeleton_id,
                        parent_id,
                        location.x,
                        location.y,
                        location.z,
                        radius,
                        confidence,
                        request.user_id,
                        now,
                        stamp.txid,
                    ],
                )?;
                let node_id = tx.last_insert_rowid();
                let node = state_tx::get_node_tx(&tx, request.project_id, node_id)?;
                edges_tx::upsert_treenode_edge_tx(&tx, &node, Some(parent.location()))?;
                let cable = location.distance(parent.location());
                summary::apply_summary_delta_tx(
                    &tx,
                    request.project_id,
                    parent.skeleton_id,
                    1,
                    cable,
                    request.user_id,
                    now,
                )?;
                spatial_update::enqueue_segment_tx(
                    &tx,
                    request.project_id,
                    location,
                    parent.location(),
                    now,
                )?;
                node_id
            }
        };

        tx.commit()?;
        Ok(node_id)
    }

    pub fn move_treenode(&mut self, request: MoveTreenodeRequest) -> Result<(), StoreError> {
        validate_project_user(request.project_id, request.user_id)?;
        let location = super::finite_point(request.location)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        state_tx::check_state_tx(&tx, request.project_id, request.node_id, &request.state)?;

        let node = state_tx::get_node_tx(&tx, request.project_id, request.node_id)?;
        let stamp = history_tx::begin_history_tx(&tx, now)?;
        history_tx::shadow_treenodes_tx(&tx, &stamp, &[node.id])?;

        let old_bounds = edges_tx::incident_bounds_tx(&tx, node.id)?;

        let parent_location = match node.parent_id {
            None => None,
            Some(parent_id) => {
                Some(state_tx::get_node_tx(&tx, request.project_id, parent_id)?.location())
            }
        };
        let children = state_tx::children_of_tx(&tx, node.id)?;

        let mut old_cable = 0.0;
        if let Some(parent_location) = parent_location {
            old_cable += node.location().distance(parent_location);
        }
        for child in &children {
            old_cable += child.location().distance(node.location());
        }

        tx.execute(
            "UPDATE treenodes SET x=?1, y=?2, z=?3, editor_id=?4, edition_time_ms=?5, \
             txid=?6 WHERE id=?7",
            params![
                location.x,
                location.y,
                location.z,
                request.user_id,
                bumped_edition(node.edition_time_ms, now),
                stamp.txid,
                node.id,
            ],
        )?;

        edges_tx::refresh_treenode_edge_tx(&tx, request.project_id, node.id)?;
        for child in &children {
            edges_tx::refresh_treenode_edge_tx(&tx, request.project_id, child.id)?;
        }
        edges_tx::refresh_link_edges_for_node_tx(&tx, request.project_id, node.id)?;

        let mut new_cable = 0.0;
        if let Some(parent_location) = parent_location {
            new_cable += location.distance(parent_location);
        }
        for child in &children {
            new_cable += child.location().distance(location);
        }
        summary::apply_summary_delta_tx(
            &tx,
            request.project_id,
            node.skeleton_id,
            0,
            new_cable - old_cable,
            request.user_id,
            now,
        )?;

        let new_bounds = edges_tx::incident_bounds_tx(&tx, node.id)?;
        let bounds = match (old_bounds, new_bounds) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (a, b) => a.or(b),
        };
        if let Some(bounds) = bounds {
            spatial_update::enqueue_box_tx(&tx, request.project_id, &bounds, now)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Moves a node under a new parent within the same skeleton. Cross-
    /// skeleton moves are joins and must go through join_skeletons.
    pub fn reparent_treenode(
        &mut self,
        request: ReparentTreenodeRequest,
    ) -> Result<(), StoreError> {
        validate_project_user(request.project_id, request.user_id)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;

        let node = state_tx::get_node_tx(&tx, request.project_id, request.node_id)?;
        let new_parent =
            state_tx::get_node_tx(&tx, request.project_id, request.new_parent_id)?;
        if new_parent.id == node.id {
            return Err(StoreError::StructuralViolation {
                node_id: node.id,
                constraint: "a node cannot be its own parent",
            });
        }
        if new_parent.skeleton_id != node.skeleton_id {
            return Err(StoreError::StructuralViolation {
                node_id: node.id,
                constraint: "new parent belongs to a different skeleton",
            });
        }
        let ancestors =
            state_tx::ancestor_chain_tx(&tx, request.project_id, new_parent.id)?;
        if ancestors.contains(&node.id) {
            return Err(StoreError::StructuralViolation {
                node_id: node.id,
                constraint: "new parent is a descendant of the node",
            });
        }

        state_tx::check_state_tx(&tx, request.project_id, node.id, &request.state)?;
        let stamp = history_tx::begin_history_tx(&tx, now)?;
        history_tx::shadow_treenodes_tx(&tx, &stamp, &[node.id])?;

        let old_cable = match node.parent_id {
            None => 0.0,
            Some(parent_id) => {
                let parent = state_tx::get_node_tx(&tx, request.project_id, parent_id)?;
                node.location().distance(parent.location())
            }
        };
        let old_edge = Aabb::of_segment(node.location(), match node.parent_id {
            None => node.location(),
            Some(parent_id) => {
                state_tx::get_node_tx(&tx, request.project_id, parent_id)?.location()
            }
        });

        tx.execute(
            "UPDATE treenodes SET parent_id=?1, editor_id=?2, edition_time_ms=?3, txid=?4 \
             WHERE id=?5",
            params![
                new_parent.id,
                request.user_id,
                bumped_edition(node.edition_time_ms, now),
                stamp.txid,
                node.id,
            ],
        )?;
        edges_tx::refresh_treenode_edge_tx(&tx, request.project_id, node.id)?;

        let new_cable = node.location().distance(new_parent.location());
        summary::apply_summary_delta_tx(
            &tx,
            request.project_id,
            node.skeleton_id,
            0,
            new_cable - old_cable,
            request.user_id,
            now,
        )?;

        let new_edge = Aabb::of_segment(node.location(), new_parent.location());
        spatial_update::enqueue_box_tx(
            &tx,
            request.project_id,
            &old_edge.union(&new_edge),
            now,
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn update_radius(&mut self, request: UpdateRadiusRequest) -> Result<(), StoreError> {
        validate_project_user(request.project_id, request.user_id)?;
        let radius = validate_radius(request.radius)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        state_tx::check_state_tx(&tx, request.project_id, request.node_id, &request.state)?;

        let node = state_tx::get_node_tx(&tx, request.project_id, request.node_id)?;
        let stamp = history_tx::begin_history_tx(&tx, now)?;
        history_tx::shadow_treenodes_tx(&tx, &stamp, &[node.id])?;
        tx.execute(
            "UPDATE treenodes SET radius=?1, editor_id=?2, edition_time_ms=?3, txid=?4 \
             WHERE id=?5",
            params![
                radius,
                request.user_id,
                bumped_edition(node.edition_time_ms, now),
                stamp.txid,
                node.id,
            ],
        )?;
        // Radius is part of cached payloads.
        spatial_update::enqueue_point_tx(&tx, request.project_id, node.location(), now)?;

        tx.commit()?;
        Ok(())
    }

    /// Confidence of the edge to the parent.
    pub fn update_confidence(
        &mut self,
        request: UpdateConfidenceRequest,
    ) -> Result<(), StoreError> {
        validate_project_user(request.project_id, request.user_id)?;
        let confidence = validate_confidence(request.confidence)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        state_tx::check_state_tx(&tx, request.project_id, request.node_id, &request.state)?;

        let node = state_tx::get_node_tx(&tx, request.project_id, request.node_id)?;
        let stamp = history_tx::begin_history_tx(&tx, now)?;
        history_tx::shadow_treenodes_tx(&tx, &stamp, &[node.id])?;
        tx.execute(
            "UPDATE treenodes SET confidence=?1, editor_id=?2, edition_time_ms=?3, txid=?4 \
             WHERE id=?5",
            params![
                confidence,
                request.user_id,
                bumped_edition(node.edition_time_ms, now),
                stamp.txid,
                node.id,
            ],
        )?;
        spatial_update::enqueue_point_tx(&tx, request.project_id, node.location(), now)?;

        tx.commit()?;
        Ok(())
    }

    /// Deletes a node, relinking its children to the deleted node's parent.
    /// A root with more than one child cannot be deleted in place; the caller
    /// must split first.
    pub fn delete_treenode(
        &mut self,
        request: DeleteTreenodeRequest,
    ) -> Result<(), StoreError> {
        validate_project_user(request.project_id, request.user_id)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        state_tx::check_state_tx(&tx, request.project_id, request.node_id, &request.state)?;

        let node = state_tx::get_node_tx(&tx, request.project_id, request.node_id)?;
        let children = state_tx::children_of_tx(&tx, node.id)?;
        if node.parent_id.is_none() && children.len() > 1 {
            return Err(StoreError::StructuralViolation {
                node_id: node.id,
                constraint: "deleting a root with multiple children would split the skeleton",
            });
        }

        let stamp = history_tx::begin_history_tx(&tx, now)?;
        let bounds = edges_tx::incident_bounds_tx(&tx, node.id)?;

        let mut cable_delta = 0.0;
        match node.parent_id {
            None => {
                if let Some(child) = children.first() {
                    history_tx::shadow_treenodes_tx(&tx, &stamp, &[child.id])?;
                    tx.execute(
                        "UPDATE treenodes SET parent_id=NULL, editor_id=?1, \
                         edition_time_ms=?2, txid=?3 WHERE id=?4",
                        params![
                            request.user_id,
                            bumped_edition(child.edition_time_ms, now),
                            stamp.txid,
                            child.id,
                        ],
                    )?;
                    edges_tx::refresh_treenode_edge_tx(&tx, request.project_id, child.id)?;
                    cable_delta -= child.location().distance(node.location());
                }
            }
            Some(parent_id) => {
                let parent = state_tx::get_node_tx(&tx, request.project_id, parent_id)?;
                for child in &children {
                    history_tx::shadow_treenodes_tx(&tx, &stamp, &[child.id])?;
                    tx.execute(
                        "UPDATE treenodes SET parent_id=?1, editor_id=?2, \
                         edition_time_ms=?3, txid=?4 WHERE id=?5",
                        params![
                            parent.id,
                            request.user_id,
                            bumped_edition(child.edition_time_ms, now),
                            stamp.txid,
                            child.id,
                        ],
                    )?;
                    edges_tx::refresh_treenode_edge_tx(&tx, request.project_id, child.id)?;
                    cable_delta += child.location().distance(parent.location())
                        - child.location().distance(node.location());
                }
                cable_delta -= node.location().distance(parent.location());
            }
        }

        // Links of the deleted node disappear with it.
        let mut stmt = tx.prepare("SELECT id FROM treenode_connectors WHERE treenode_id=?1")?;
        let mut rows = stmt.query(params![node.id])?;
        let mut link_ids = Vec::new();
        while let Some(row) = rows.next()? {
            link_ids.push(row.get::<_, i64>(0)?);
        }
        drop(rows);
        drop(stmt);
        history_tx::shadow_links_tx(&tx, &stamp, &link_ids)?;
        for link_id in &link_ids {
            edges_tx::delete_connector_edge_tx(&tx, *link_id)?;
        }
        tx.execute(
            "DELETE FROM treenode_connectors WHERE treenode_id=?1",
            params![node.id],
        )?;
        tx.execute(
            "DELETE FROM node_tags WHERE project_id=?1 AND treenode_id=?2",
            params![request.project_id, node.id],
        )?;

        history_tx::shadow_treenodes_tx(&tx, &stamp, &[node.id])?;
        edges_tx::delete_treenode_edge_tx(&tx, node.id)?;
        tx.execute("DELETE FROM treenodes WHERE id=?1", params![node.id])?;

        summary::apply_summary_delta_tx(
            &tx,
            request.project_id,
            node.skeleton_id,
            -1,
            cable_delta,
            request.user_id,
            now,
        )?;

        if let Some(bounds) = bounds {
            spatial_update::enqueue_box_tx(&tx, request.project_id, &bounds, now)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Tags are metadata: no edition bump, no state descriptor.
    pub fn add_node_tag(&mut self, request: AddNodeTagRequest) -> Result<bool, StoreError> {
        validate_project_user(request.project_id, request.user_id)?;
        let tag = request.tag.trim();
        if tag.is_empty() {
            return Err(StoreError::InvalidInput("tag must not be empty"));
        }
        if tag.len() > 255 {
            return Err(StoreError::InvalidInput("tag too long"));
        }

        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        state_tx::lock_nodes_tx(&tx, request.project_id, &[request.node_id])?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO node_tags(project_id, treenode_id, tag, user_id, \
             created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.project_id,
                request.node_id,
                tag,
                request.user_id,
                now_ms(),
            ],
        )?;
        tx.commit()?;
        Ok(inserted > 0)
    }

    pub fn remove_node_tag(
        &mut self,
        request: RemoveNodeTagRequest,
    ) -> Result<bool, StoreError> {
        validate_project_user(request.project_id, request.user_id)?;
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        state_tx::lock_nodes_tx(&tx, request.project_id, &[request.node_id])?;
        let removed = tx.execute(
            "DELETE FROM node_tags WHERE project_id=?1 AND treenode_id=?2 AND tag=?3",
            params![request.project_id, request.node_id, request.tag.trim()],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    pub fn node_tags(&self, project_id: i64, node_id: i64) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT tag FROM node_tags WHERE project_id=?1 AND treenode_id=?2 ORDER BY tag",
        )?;
        let mut rows = stmt.query(params![project_id, node_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    /// Review is additive metadata and does not bump the edition stamp, so
    /// it never races with geometry edits.
    pub fn mark_reviewed(&mut self, request: MarkReviewedRequest) -> Result<(), StoreError> {
        validate_project_user(request.project_id, request.reviewer_id)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(
            &tx,
            request.project_id,
            request.reviewer_id,
            Role::Annotate,
        )?;
        state_tx::lock_nodes_tx(&tx, request.project_id, &[request.node_id])?;

        let stamp = history_tx::begin_history_tx(&tx, now)?;
        history_tx::shadow_treenodes_tx(&tx, &stamp, &[request.node_id])?;
        tx.execute(
            "UPDATE treenodes SET reviewer_id=?1, review_time_ms=?2, txid=?3 WHERE id=?4",
            params![request.reviewer_id, now, stamp.txid, request.node_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn treenode(&self, project_id: i64, node_id: i64) -> Result<TreenodeRow, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, parent_id, x, y, z, confidence, radius, skeleton_id, \
                 edition_time_ms, user_id FROM treenodes WHERE id=?1 AND project_id=?2",
                params![node_id, project_id],
                |row| {
                    Ok(TreenodeRow {
                        id: row.get(0)?,
                        parent_id: row.get(1)?,
                        x: row.get(2)?,
                        y: row.get(3)?,
                        z: row.get(4)?,
                        confidence: row.get(5)?,
                        radius: row.get(6)?,
                        skeleton_id: row.get(7)?,
                        edition_time_ms: row.get(8)?,
                        user_id: row.get(9)?,
                    })
                },
            )
            .optional()?;
        row.ok_or(StoreError::UnknownNode { node_id })
    }
}
