//! Volume Provisioner
//!
//! Creates a volume in the local zone and tags it in a second call. The
//! two calls are not atomic: a volume whose tagging fails still exists
//! and is reported through [`Error::TagApplication`].

use crate::domain::ports::{
    ControlPlane, CreateVolumeRequest, InstanceContext, Tags, FILESYSTEM_TAG, NAME_TAG,
};
use crate::error::{Error, Result};
use tracing::{info, warn};

/// Creates and tags new volumes
pub struct VolumeProvisioner;

impl VolumeProvisioner {
    /// Create a volume, restoring `request.snapshot_id` if set, then tag it
    pub async fn create_volume(
        control_plane: &dyn ControlPlane,
        context: &InstanceContext,
        request: &CreateVolumeRequest,
    ) -> Result<String> {
        info!(
            "Creating volume {} ({} GiB, {}) in {}{}",
            request.name,
            request.size_gib,
            request.volume_type,
            context.availability_zone,
            request
                .snapshot_id
                .as_ref()
                .map(|s| format!(" from snapshot {}", s))
                .unwrap_or_default()
        );

        let volume_id = control_plane
            .create_volume(&context.availability_zone, request)
            .await
            .map_err(|e| Error::Provisioning {
                reason: e.to_string(),
            })?;

        let tags = Self::creation_tags(request);
        if let Err(e) = control_plane.create_tags(&volume_id, &tags).await {
            warn!("Volume {} created but not tagged: {}", volume_id, e);
            return Err(Error::TagApplication {
                volume_id,
                reason: e.to_string(),
            });
        }

        info!("Created volume {}", volume_id);
        Ok(volume_id)
    }

    /// Tags applied to a freshly created volume
    ///
    /// A restored volume already carries a filesystem; a blank one does
    /// not. `Name` and `filesystem` cannot be overridden by caller tags.
    pub fn creation_tags(request: &CreateVolumeRequest) -> Tags {
        let mut tags = request.tags.clone();
        for reserved in [NAME_TAG, FILESYSTEM_TAG] {
            if tags.contains_key(reserved) {
                warn!("Ignoring caller-supplied {} tag", reserved);
            }
        }

        let filesystem = if request.snapshot_id.is_some() {
            "true"
        } else {
            "false"
        };
        tags.insert(NAME_TAG.to_string(), request.name.clone());
        tags.insert(FILESYSTEM_TAG.to_string(), filesystem.to_string());
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeType;
    use crate::controlplane::platform::memory::InMemoryControlPlane;
    use crate::domain::ports::VolumeState;
    use crate::host::memory::DeviceNodes;
    use assert_matches::assert_matches;

    fn context() -> InstanceContext {
        InstanceContext {
            region: "us-east-1".into(),
            availability_zone: "us-east-1a".into(),
            instance_id: "i-local".into(),
        }
    }

    fn request(snapshot_id: Option<&str>) -> CreateVolumeRequest {
        let mut tags = Tags::new();
        tags.insert("env".into(), "staging".into());
        tags.insert("filesystem".into(), "true".into());
        CreateVolumeRequest {
            size_gib: 20,
            name: "staging-data".into(),
            volume_type: VolumeType::Gp2,
            tags,
            snapshot_id: snapshot_id.map(String::from),
        }
    }

    #[test]
    fn test_creation_tags() {
        let blank = VolumeProvisioner::creation_tags(&request(None));
        assert_eq!(blank.get("Name").map(String::as_str), Some("staging-data"));
        assert_eq!(blank.get("filesystem").map(String::as_str), Some("false"));
        assert_eq!(blank.get("env").map(String::as_str), Some("staging"));

        let restored = VolumeProvisioner::creation_tags(&request(Some("snap-1")));
        assert_eq!(restored.get("filesystem").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn test_create_blank_volume() {
        let cloud = InMemoryControlPlane::new(DeviceNodes::new());

        let volume_id = VolumeProvisioner::create_volume(&cloud, &context(), &request(None))
            .await
            .unwrap();

        let volume = cloud.volume(&volume_id).unwrap();
        assert_eq!(volume.availability_zone, "us-east-1a");
        assert_eq!(volume.state, VolumeState::Creating);
        assert_eq!(volume.tags.get("filesystem").map(String::as_str), Some("false"));
        assert_eq!(volume.tags.get("Name").map(String::as_str), Some("staging-data"));
    }

    #[tokio::test]
    async fn test_tag_failure_keeps_volume() {
        let cloud = InMemoryControlPlane::new(DeviceNodes::new());
        cloud.fail_create_tags(true);

        let result = VolumeProvisioner::create_volume(&cloud, &context(), &request(None)).await;
        let err = result.unwrap_err();
        assert_matches!(&err, Error::TagApplication { .. });

        let leaked = err.leaked_volume().unwrap();
        let volume = cloud.volume(leaked).unwrap();
        assert!(volume.tags.is_empty());
    }

    #[tokio::test]
    async fn test_create_failure() {
        let cloud = InMemoryControlPlane::new(DeviceNodes::new());
        cloud.fail_create(true);

        let result = VolumeProvisioner::create_volume(&cloud, &context(), &request(None)).await;
        assert_matches!(result, Err(Error::Provisioning { .. }));
        assert!(cloud.volumes().is_empty());
    }
}
