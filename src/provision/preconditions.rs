//! Precondition Checks
//!
//! Run before anything touches the control plane: the target device node
//! must not exist yet and the mount point must not be mounted.

use crate::domain::ports::HostSystem;
use crate::error::{Error, Result};
use std::path::Path;
use tracing::warn;

/// Verifies the host is ready for a fresh attachment
pub struct PreconditionChecker;

impl PreconditionChecker {
    /// Fail if `device` exists, or cannot be confirmed absent
    pub async fn check_device(host: &dyn HostSystem, device: &Path) -> Result<()> {
        match host.path_exists(device).await {
            Ok(false) => Ok(()),
            Ok(true) => Err(Error::DeviceExists {
                device: device.to_path_buf(),
            }),
            Err(e) => {
                warn!("Could not check {}: {}", device.display(), e);
                Err(Error::DeviceExists {
                    device: device.to_path_buf(),
                })
            }
        }
    }

    /// Fail if `mount_point` appears anywhere in the mount table
    ///
    /// This is a plain substring match over the table; an unreadable table
    /// counts as empty.
    pub async fn check_mount_point(host: &dyn HostSystem, mount_point: &Path) -> Result<()> {
        let table = match host.read_mount_table().await {
            Ok(table) => table,
            Err(e) => {
                warn!("Failed to read mount table: {}", e);
                String::new()
            }
        };

        if table.contains(&*mount_point.to_string_lossy()) {
            return Err(Error::AlreadyMounted {
                mount_point: mount_point.to_path_buf(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{DeviceNodes, FakeHost};
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_device_must_be_absent() {
        let nodes = DeviceNodes::new();
        let host = FakeHost::new(nodes.clone());
        let device = Path::new("/dev/xvdb");

        PreconditionChecker::check_device(&host, device).await.unwrap();

        nodes.insert(device);
        assert_matches!(
            PreconditionChecker::check_device(&host, device).await,
            Err(Error::DeviceExists { .. })
        );
    }

    #[tokio::test]
    async fn test_mount_point_must_not_be_mounted() {
        let host = FakeHost::new(DeviceNodes::new());
        host.add_mount_entry("/dev/xvda1 / ext4 rw,relatime 0 0");

        PreconditionChecker::check_mount_point(&host, Path::new("/data"))
            .await
            .unwrap();

        host.add_mount_entry("/dev/xvdf /data ext4 rw,relatime 0 0");
        assert_matches!(
            PreconditionChecker::check_mount_point(&host, Path::new("/data")).await,
            Err(Error::AlreadyMounted { .. })
        );
    }

    #[tokio::test]
    async fn test_unreadable_mount_table_counts_as_empty() {
        let host = FakeHost::new(DeviceNodes::new());
        host.make_mount_table_unreadable();

        PreconditionChecker::check_mount_point(&host, Path::new("/data"))
            .await
            .unwrap();
    }
}
