//! In-memory Host
//!
//! Records what the provisioner does to the local machine instead of
//! doing it. Device nodes are shared with the in-memory control plane so
//! that an attach there makes `/dev/{name}` show up here.

use crate::domain::ports::HostSystem;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// Device Nodes
// =============================================================================

/// Set of device nodes visible to a fake host
#[derive(Debug, Clone, Default)]
pub struct DeviceNodes(Arc<Mutex<BTreeSet<PathBuf>>>);

impl DeviceNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: impl Into<PathBuf>) {
        self.0.lock().insert(device.into());
    }

    pub fn contains(&self, device: &Path) -> bool {
        self.0.lock().contains(device)
    }
}

// =============================================================================
// Fake Host
// =============================================================================

#[derive(Debug, Default)]
struct HostState {
    mount_table: String,
    directories: BTreeSet<PathBuf>,
    mounts: Vec<(PathBuf, PathBuf)>,
    formats: Vec<(PathBuf, u64)>,
    fail_format: bool,
    fail_mount: bool,
    mount_table_unreadable: bool,
}

/// Host that keeps its mount table, directories and devices in memory
#[derive(Debug, Default)]
pub struct FakeHost {
    device_nodes: DeviceNodes,
    state: Mutex<HostState>,
}

impl FakeHost {
    /// Create a host seeing the given device nodes
    pub fn new(device_nodes: DeviceNodes) -> Self {
        Self {
            device_nodes,
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn device_nodes(&self) -> &DeviceNodes {
        &self.device_nodes
    }

    /// Append a line to the mount table
    pub fn add_mount_entry(&self, line: &str) {
        let mut state = self.state.lock();
        state.mount_table.push_str(line);
        state.mount_table.push('\n');
    }

    pub fn fail_format(&self, fail: bool) {
        self.state.lock().fail_format = fail;
    }

    pub fn fail_mount(&self, fail: bool) {
        self.state.lock().fail_mount = fail;
    }

    pub fn make_mount_table_unreadable(&self) {
        self.state.lock().mount_table_unreadable = true;
    }

    /// Devices mounted so far, with their mount points
    pub fn mounts(&self) -> Vec<(PathBuf, PathBuf)> {
        self.state.lock().mounts.clone()
    }

    /// Devices formatted so far, with the inode ratio used
    pub fn formats(&self) -> Vec<(PathBuf, u64)> {
        self.state.lock().formats.clone()
    }

    pub fn has_directory(&self, path: &Path) -> bool {
        self.state.lock().directories.contains(path)
    }
}

#[async_trait]
impl HostSystem for FakeHost {
    async fn path_exists(&self, path: &Path) -> Result<bool> {
        Ok(self.device_nodes.contains(path) || self.state.lock().directories.contains(path))
    }

    async fn read_mount_table(&self) -> Result<String> {
        let state = self.state.lock();
        if state.mount_table_unreadable {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "mount table unreadable",
            )));
        }
        Ok(state.mount_table.clone())
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        for ancestor in path.ancestors() {
            if !ancestor.as_os_str().is_empty() {
                state.directories.insert(ancestor.to_path_buf());
            }
        }
        Ok(())
    }

    async fn mount(&self, device: &Path, mount_point: &Path) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_mount || !self.device_nodes.contains(device) {
            return Err(Error::Command {
                command: "mount".into(),
                reason: format!("special device {} does not exist", device.display()),
            });
        }
        if !state.directories.contains(mount_point) {
            return Err(Error::Command {
                command: "mount".into(),
                reason: format!("mount point {} does not exist", mount_point.display()),
            });
        }

        let line = format!("{} {} ext4 rw,relatime 0 0\n", device.display(), mount_point.display());
        state.mount_table.push_str(&line);
        state.mounts.push((device.to_path_buf(), mount_point.to_path_buf()));
        Ok(())
    }

    async fn format(&self, device: &Path, inode_ratio: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_format || !self.device_nodes.contains(device) {
            return Err(Error::Command {
                command: "mkfs.ext4".into(),
                reason: format!("could not open {}", device.display()),
            });
        }
        state.formats.push((device.to_path_buf(), inode_ratio));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mount_requires_device_and_directory() {
        let nodes = DeviceNodes::new();
        let host = FakeHost::new(nodes.clone());
        let device = Path::new("/dev/xvdb");
        let mount_point = Path::new("/data/app");

        assert!(host.mount(device, mount_point).await.is_err());

        nodes.insert(device);
        assert!(host.mount(device, mount_point).await.is_err());

        host.create_dir_all(mount_point).await.unwrap();
        assert!(host.has_directory(Path::new("/data")));
        host.mount(device, mount_point).await.unwrap();

        let table = host.read_mount_table().await.unwrap();
        assert!(table.contains("/dev/xvdb /data/app ext4"));
        assert_eq!(host.mounts().len(), 1);
    }

    #[tokio::test]
    async fn test_format_records_ratio() {
        let nodes = DeviceNodes::new();
        nodes.insert("/dev/xvdb");
        let host = FakeHost::new(nodes);

        host.format(Path::new("/dev/xvdb"), 4096).await.unwrap();
        assert_eq!(host.formats(), vec![(PathBuf::from("/dev/xvdb"), 4096)]);

        host.fail_format(true);
        assert!(host.format(Path::new("/dev/xvdb"), 4096).await.is_err());
    }
}
