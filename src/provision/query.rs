//! Tag Filter Queries
//!
//! Read-only discovery of reusable volumes and restorable snapshots.

use crate::domain::ports::{
    ControlPlane, InstanceContext, SnapshotFilter, SnapshotState, TagQuery, VolumeFilter,
    VolumeState, FILESYSTEM_TAG, OWNER_SELF,
};
use crate::error::{Error, Result};
use tracing::debug;

/// Volume and snapshot discovery by tag
pub struct TagFilterQuery;

impl TagFilterQuery {
    /// Find an available, formatted volume carrying `query` in the local
    /// zone. The first match in control-plane order wins.
    pub async fn find_volume(
        control_plane: &dyn ControlPlane,
        context: &InstanceContext,
        query: &TagQuery,
    ) -> Result<Option<String>> {
        let filter = VolumeFilter {
            tags: vec![query.clone(), TagQuery::new(FILESYSTEM_TAG, "true")],
            state: Some(VolumeState::Available),
            availability_zone: Some(context.availability_zone.clone()),
            ..Default::default()
        };

        let volumes = control_plane
            .describe_volumes(&filter)
            .await
            .map_err(|e| Error::Query {
                query: format!("volumes with {} in {}", query, context.availability_zone),
                reason: e.to_string(),
            })?;

        debug!("{} reusable volumes match {}", volumes.len(), query);
        Ok(volumes
            .into_iter()
            .find(|v| v.is_reusable_in(&context.availability_zone))
            .map(|v| v.volume_id))
    }

    /// Find the newest completed snapshot carrying `query` among those
    /// owned by this account. Public and shared snapshots are never
    /// considered, whatever their tags.
    ///
    /// Snapshots with equal start times keep control-plane order, so which
    /// of them wins is up to the control plane.
    pub async fn find_snapshot(
        control_plane: &dyn ControlPlane,
        query: &TagQuery,
    ) -> Result<Option<String>> {
        let filter = SnapshotFilter {
            tags: vec![query.clone()],
            state: Some(SnapshotState::Completed),
            owner_ids: vec![OWNER_SELF.to_string()],
        };

        let mut snapshots = control_plane
            .describe_snapshots(&filter)
            .await
            .map_err(|e| Error::Query {
                query: format!("snapshots with {}", query),
                reason: e.to_string(),
            })?;

        debug!("{} completed snapshots match {}", snapshots.len(), query);
        snapshots.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(snapshots.into_iter().next().map(|s| s.snapshot_id))
    }
}
