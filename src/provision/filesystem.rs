//! Filesystem Initializer
//!
//! Formats a blank device, then marks its volume `filesystem=true` so
//! later instances reuse it instead of formatting again. Formatting and
//! marking are separate steps: a failed mark leaves a formatted volume
//! that discovery still treats as blank.

use crate::domain::ports::{ControlPlane, HostSystem, Tags, FILESYSTEM_TAG};
use crate::error::{Error, Result};
use std::path::Path;
use tracing::{info, warn};

/// Formats blank volumes
pub struct FilesystemInitializer;

impl FilesystemInitializer {
    pub async fn make_file_system(
        control_plane: &dyn ControlPlane,
        host: &dyn HostSystem,
        device: &Path,
        inode_ratio: u64,
        volume_id: &str,
    ) -> Result<()> {
        info!(
            "Creating file system on {} (inode ratio {})",
            device.display(),
            inode_ratio
        );
        host.format(device, inode_ratio)
            .await
            .map_err(|e| Error::Format {
                device: device.to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut tags = Tags::new();
        tags.insert(FILESYSTEM_TAG.to_string(), "true".to_string());
        if let Err(e) = control_plane.create_tags(volume_id, &tags).await {
            warn!(
                "Volume {} carries a file system but is still marked blank: {}",
                volume_id, e
            );
            return Err(Error::Tagging {
                volume_id: volume_id.to_string(),
                reason: e.to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::platform::memory::{ControlPlaneCall, InMemoryControlPlane};
    use crate::domain::ports::{Volume, VolumeState};
    use crate::host::memory::{DeviceNodes, FakeHost};
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    fn setup() -> (InMemoryControlPlane, FakeHost) {
        let nodes = DeviceNodes::new();
        nodes.insert("/dev/xvdb");
        let cloud = InMemoryControlPlane::new(nodes.clone());
        let mut tags = Tags::new();
        tags.insert(FILESYSTEM_TAG.into(), "false".into());
        cloud.add_volume(Volume {
            volume_id: "vol-1".into(),
            availability_zone: "us-east-1a".into(),
            state: VolumeState::InUse,
            tags,
        });
        (cloud, FakeHost::new(nodes))
    }

    fn filesystem_tag(cloud: &InMemoryControlPlane) -> Option<String> {
        cloud.volume("vol-1").unwrap().tags.get(FILESYSTEM_TAG).cloned()
    }

    #[tokio::test]
    async fn test_format_then_mark() {
        let (cloud, host) = setup();

        FilesystemInitializer::make_file_system(&cloud, &host, Path::new("/dev/xvdb"), 16384, "vol-1")
            .await
            .unwrap();

        assert_eq!(host.formats(), vec![(PathBuf::from("/dev/xvdb"), 16384)]);
        assert_eq!(filesystem_tag(&cloud).as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_format_failure_leaves_tag() {
        let (cloud, host) = setup();
        host.fail_format(true);

        let result =
            FilesystemInitializer::make_file_system(&cloud, &host, Path::new("/dev/xvdb"), 16384, "vol-1")
                .await;

        assert_matches!(result, Err(Error::Format { .. }));
        assert_eq!(filesystem_tag(&cloud).as_deref(), Some("false"));
        assert!(!cloud
            .calls()
            .iter()
            .any(|c| matches!(c, ControlPlaneCall::CreateTags { .. })));
    }

    #[tokio::test]
    async fn test_mark_failure_after_format() {
        let (cloud, host) = setup();
        cloud.fail_create_tags(true);

        let result =
            FilesystemInitializer::make_file_system(&cloud, &host, Path::new("/dev/xvdb"), 16384, "vol-1")
                .await;

        let err = result.unwrap_err();
        assert_matches!(&err, Error::Tagging { .. });
        assert_eq!(err.leaked_volume(), Some("vol-1"));
        assert_eq!(host.formats().len(), 1);
        assert_eq!(filesystem_tag(&cloud).as_deref(), Some("false"));
    }
}
