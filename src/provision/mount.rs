//! Mount Manager

use crate::domain::ports::HostSystem;
use crate::error::{Error, Result};
use std::path::Path;
use tracing::info;

/// Mounts attached volumes
pub struct MountManager;

impl MountManager {
    /// Create `mount_point` if needed and mount `device` on it
    pub async fn mount_volume(host: &dyn HostSystem, device: &Path, mount_point: &Path) -> Result<()> {
        let mount_error = |e: Error| Error::Mount {
            device: device.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            reason: e.to_string(),
        };

        host.create_dir_all(mount_point).await.map_err(mount_error)?;

        info!("Mounting {} at {}", device.display(), mount_point.display());
        host.mount(device, mount_point).await.map_err(mount_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{DeviceNodes, FakeHost};
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_mount_creates_directory() {
        let nodes = DeviceNodes::new();
        nodes.insert("/dev/xvdb");
        let host = FakeHost::new(nodes);

        MountManager::mount_volume(&host, Path::new("/dev/xvdb"), Path::new("/srv/data"))
            .await
            .unwrap();

        assert!(host.has_directory(Path::new("/srv/data")));
        assert_eq!(
            host.mounts(),
            vec![(PathBuf::from("/dev/xvdb"), PathBuf::from("/srv/data"))]
        );
    }

    #[tokio::test]
    async fn test_mount_failure() {
        let nodes = DeviceNodes::new();
        nodes.insert("/dev/xvdb");
        let host = FakeHost::new(nodes);
        host.fail_mount(true);

        let result =
            MountManager::mount_volume(&host, Path::new("/dev/xvdb"), Path::new("/srv/data")).await;
        assert_matches!(result, Err(Error::Mount { .. }));
    }
}
