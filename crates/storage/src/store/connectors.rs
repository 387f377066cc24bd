#![forbid(unsafe_code)]

use super::support::{edges_tx, history_tx, perm_tx, state_tx};
use super::{
    AddLinkRequest, ConnectorLinkRow, ConnectorRow, CreateConnectorRequest,
    DeleteConnectorRequest, MoveConnectorRequest, RemoveLinkRequest, SqliteStore, StoreError,
    bumped_edition, now_ms, spatial_update, validate_confidence, validate_project_user,
};
use nr_core::geom::{Aabb, Point3};
use nr_core::model::Role;
use rusqlite::{Connection, OptionalExtension, params};

impl SqliteStore {
    pub fn create_connector(
        &mut self,
        request: CreateConnectorRequest,
    ) -> Result<i64, StoreError> {
        validate_project_user(request.project_id, request.user_id)?;
        let confidence = validate_confidence(request.confidence)?;
        let location = super::finite_point(request.location)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        let stamp = history_tx::begin_history_tx(&tx, now)?;

        tx.execute(
            "INSERT INTO connectors(project_id, x, y, z, confidence, user_id, editor_id, \
             creation_time_ms, edition_time_ms, txid) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?7, ?8)",
            params![
                request.project_id,
                location.x,
                location.y,
                location.z,
                confidence,
                request.user_id,
                now,
                stamp.txid,
            ],
        )?;
        let connector_id = tx.last_insert_rowid();
        spatial_update::enqueue_point_tx(&tx, request.project_id, location, now)?;

        tx.commit()?;
        Ok(connector_id)
    }

    pub fn move_connector(&mut self, request: MoveConnectorRequest) -> Result<(), StoreError> {
        validate_project_user(request.project_id, request.user_id)?;
        let location = super::finite_point(request.location)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        state_tx::check_connector_state_tx(
            &tx,
            request.project_id,
            request.connector_id,
            &request.state,
        )?;

        let connector =
            state_tx::get_connector_tx(&tx, request.project_id, request.connector_id)?;
        let stamp = history_tx::begin_history_tx(&tx, now)?;
        history_tx::shadow_connectors_tx(&tx, &stamp, &[connector.id])?;

        let old_bounds = connector_bounds_tx(&tx, connector.id, connector.location())?;
        tx.execute(
            "UPDATE connectors SET x=?1, y=?2, z=?3, editor_id=?4, edition_time_ms=?5, \
             txid=?6 WHERE id=?7",
            params![
                location.x,
                location.y,
                location.z,
                request.user_id,
                bumped_edition(connector.edition_time_ms, now),
                stamp.txid,
                connector.id,
            ],
        )?;
        edges_tx::refresh_link_edges_for_connector_tx(&tx, request.project_id, connector.id)?;

        let new_bounds = connector_bounds_tx(&tx, connector.id, location)?;
        spatial_update::enqueue_box_tx(
            &tx,
            request.project_id,
            &old_bounds.union(&new_bounds),
            now,
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Removes the connector together with all of its links.
    pub fn delete_connector(
        &mut self,
        request: DeleteConnectorRequest,
    ) -> Result<(), StoreError> {
        validate_project_user(request.project_id, request.user_id)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        state_tx::check_connector_state_tx(
            &tx,
            request.project_id,
            request.connector_id,
            &request.state,
        )?;

        let connector =
            state_tx::get_connector_tx(&tx, request.project_id, request.connector_id)?;
        let stamp = history_tx::begin_history_tx(&tx, now)?;

        let mut stmt =
            tx.prepare("SELECT id FROM treenode_connectors WHERE connector_id=?1")?;
        let mut rows = stmt.query(params![connector.id])?;
        let mut link_ids = Vec::new();
        while let Some(row) = rows.next()? {
            link_ids.push(row.get::<_, i64>(0)?);
        }
        drop(rows);
        drop(stmt);

        let bounds = connector_bounds_tx(&tx, connector.id, connector.location())?;

        history_tx::shadow_links_tx(&tx, &stamp, &link_ids)?;
        for link_id in &link_ids {
            edges_tx::delete_connector_edge_tx(&tx, *link_id)?;
        }
        tx.execute(
            "DELETE FROM treenode_connectors WHERE connector_id=?1",
            params![connector.id],
        )?;

        history_tx::shadow_connectors_tx(&tx, &stamp, &[connector.id])?;
        tx.execute("DELETE FROM connectors WHERE id=?1", params![connector.id])?;

        spatial_update::enqueue_box_tx(&tx, request.project_id, &bounds, now)?;

        tx.commit()?;
        Ok(())
    }

    /// Links a treenode to a connector under a relation. Both endpoints carry
    /// their own state descriptor; the pair (node, connector, relation) is
    /// unique.
    pub fn add_link(&mut self, request: AddLinkRequest) -> Result<i64, StoreError> {
        validate_project_user(request.project_id, request.user_id)?;
        let confidence = validate_confidence(request.confidence)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;
        state_tx::check_state_tx(
            &tx,
            request.project_id,
            request.treenode_id,
            &request.treenode_state,
        )?;
        state_tx::check_connector_state_tx(
            &tx,
            request.project_id,
            request.connector_id,
            &request.connector_state,
        )?;

        let node = state_tx::get_node_tx(&tx, request.project_id, request.treenode_id)?;
        let connector =
            state_tx::get_connector_tx(&tx, request.project_id, request.connector_id)?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM treenode_connectors WHERE project_id=?1 AND treenode_id=?2 \
                 AND connector_id=?3 AND relation=?4",
                params![
                    request.project_id,
                    node.id,
                    connector.id,
                    request.relation.as_str(),
                ],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::LinkExists {
                treenode_id: node.id,
                connector_id: connector.id,
            });
        }

        let stamp = history_tx::begin_history_tx(&tx, now)?;
        tx.execute(
            "INSERT INTO treenode_connectors(project_id, treenode_id, connector_id, \
             relation, confidence, user_id, creation_time_ms, edition_time_ms, txid) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8)",
            params![
                request.project_id,
                node.id,
                connector.id,
                request.relation.as_str(),
                confidence,
                request.user_id,
                now,
                stamp.txid,
            ],
        )?;
        let link_id = tx.last_insert_rowid();
        edges_tx::upsert_connector_edge_tx(
            &tx,
            link_id,
            request.project_id,
            node.id,
            connector.id,
            node.location(),
            connector.location(),
        )?;
        spatial_update::enqueue_segment_tx(
            &tx,
            request.project_id,
            node.location(),
            connector.location(),
            now,
        )?;

        tx.commit()?;
        Ok(link_id)
    }

    pub fn remove_link(&mut self, request: RemoveLinkRequest) -> Result<(), StoreError> {
        validate_project_user(request.project_id, request.user_id)?;

        let now = now_ms();
        let tx = self.mutation_tx()?;
        perm_tx::require_role_tx(&tx, request.project_id, request.user_id, Role::Annotate)?;

        let link: Option<(i64, i64)> = tx
            .query_row(
                "SELECT treenode_id, connector_id FROM treenode_connectors \
                 WHERE id=?1 AND project_id=?2",
                params![request.link_id, request.project_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (treenode_id, connector_id) = link.ok_or(StoreError::UnknownLink {
            link_id: request.link_id,
        })?;

        state_tx::check_state_tx(&tx, request.project_id, treenode_id, &request.state)?;

        let node = state_tx::get_node_tx(&tx, request.project_id, treenode_id)?;
        let connector = state_tx::get_connector_tx(&tx, request.project_id, connector_id)?;

        let stamp = history_tx::begin_history_tx(&tx, now)?;
        history_tx::shadow_links_tx(&tx, &stamp, &[request.link_id])?;
        edges_tx::delete_connector_edge_tx(&tx, request.link_id)?;
        tx.execute(
            "DELETE FROM treenode_connectors WHERE id=?1",
            params![request.link_id],
        )?;
        spatial_update::enqueue_segment_tx(
            &tx,
            request.project_id,
            node.location(),
            connector.location(),
            now,
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn connector(
        &self,
        project_id: i64,
        connector_id: i64,
    ) -> Result<ConnectorRow, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, x, y, z, confidence, edition_time_ms, user_id FROM connectors \
                 WHERE id=?1 AND project_id=?2",
                params![connector_id, project_id],
                |row| {
                    Ok(ConnectorRow {
                        id: row.get(0)?,
                        x: row.get(1)?,
                        y: row.get(2)?,
                        z: row.get(3)?,
                        confidence: row.get(4)?,
                        edition_time_ms: row.get(5)?,
                        user_id: row.get(6)?,
                        links: Vec::new(),
                    })
                },
            )
            .optional()?;
        let mut connector = row.ok_or(StoreError::UnknownConnector { connector_id })?;

        let mut stmt = self.conn.prepare(
            "SELECT id, treenode_id, relation, confidence, edition_time_ms \
             FROM treenode_connectors WHERE connector_id=?1 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![connector_id])?;
        while let Some(row) = rows.next()? {
            connector.links.push(ConnectorLinkRow {
                link_id: row.get(0)?,
                treenode_id: row.get(1)?,
                relation: row.get(2)?,
                confidence: row.get(3)?,
                edition_time_ms: row.get(4)?,
            });
        }
        Ok(connector)
    }
}

/// Union box of the connector's location and all of its link edges.
fn connector_bounds_tx(
    conn: &Connection,
    connector_id: i64,
    location: Point3,
) -> Result<Aabb, StoreError> {
    let mut bounds = Aabb::of_point(location);
    let mut stmt = conn.prepare(
        "SELECT min_x, min_y, min_z, max_x, max_y, max_z FROM connector_edges \
         WHERE connector_id=?1",
    )?;
    let mut rows = stmt.query(params![connector_id])?;
    while let Some(row) = rows.next()? {
        let edge = Aabb::of_segment(
            Point3::new(row.get(0)?, row.get(1)?, row.get(2)?),
            Point3::new(row.get(3)?, row.get(4)?, row.get(5)?),
        );
        bounds = bounds.union(&edge);
    }
    Ok(bounds)
}
