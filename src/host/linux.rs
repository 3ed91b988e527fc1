//! Linux Host
//!
//! Device checks, `/proc/mounts`, `mkfs.ext4` and `mount` on the local
//! machine.

use crate::domain::ports::HostSystem;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

const PROC_MOUNTS: &str = "/proc/mounts";
const MKFS_EXT4: &str = "/usr/sbin/mkfs.ext4";
const MOUNT: &str = "/bin/mount";

// =============================================================================
// Configuration
// =============================================================================

/// Paths of the OS primitives the host shells out to
#[derive(Debug, Clone)]
pub struct LinuxHostConfig {
    /// Mount table to scan
    pub mount_table: PathBuf,
    /// Filesystem formatter, invoked as `<mkfs> -i <ratio> <device>`
    pub mkfs_command: PathBuf,
    /// Mount binary, invoked as `<mount> <device> <dir>`
    pub mount_command: PathBuf,
    /// Mode of directories created for the mount point
    pub dir_mode: u32,
}

impl Default for LinuxHostConfig {
    fn default() -> Self {
        Self {
            mount_table: PathBuf::from(PROC_MOUNTS),
            mkfs_command: PathBuf::from(MKFS_EXT4),
            mount_command: PathBuf::from(MOUNT),
            dir_mode: 0o755,
        }
    }
}

// =============================================================================
// Linux Host
// =============================================================================

/// Host backed by the real operating system
#[derive(Debug, Clone, Default)]
pub struct LinuxHost {
    config: LinuxHostConfig,
}

impl LinuxHost {
    pub fn new(config: LinuxHostConfig) -> Self {
        Self { config }
    }

    /// Run a command to completion, failing on a non-zero exit
    async fn run(&self, command: &Path, args: &[&str]) -> Result<()> {
        let name = command.display().to_string();
        info!("Running command: {} {}", name, args.join(" "));

        let output = Command::new(command)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Command {
                command: name.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "Command {} failed with {}: {}{}",
                name,
                output.status,
                stdout.trim(),
                stderr.trim()
            );
            return Err(Error::Command {
                command: name,
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        debug!("Command {} succeeded", name);
        Ok(())
    }
}

#[async_trait]
impl HostSystem for LinuxHost {
    async fn path_exists(&self, path: &Path) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn read_mount_table(&self) -> Result<String> {
        Ok(tokio::fs::read_to_string(&self.config.mount_table).await?)
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(self.config.dir_mode);
        builder.create(path).await?;
        Ok(())
    }

    async fn mount(&self, device: &Path, mount_point: &Path) -> Result<()> {
        let device = device.to_string_lossy();
        let mount_point = mount_point.to_string_lossy();
        self.run(&self.config.mount_command, &[&*device, &*mount_point])
            .await
    }

    async fn format(&self, device: &Path, inode_ratio: u64) -> Result<()> {
        let ratio = inode_ratio.to_string();
        let device = device.to_string_lossy();
        self.run(&self.config.mkfs_command, &["-i", &ratio, &*device])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_path_exists() {
        let dir = TempDir::new().unwrap();
        let host = LinuxHost::default();

        assert!(host.path_exists(dir.path()).await.unwrap());
        assert!(!host.path_exists(&dir.path().join("xvdb")).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_mount_table() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("mounts");
        std::fs::write(&table, "/dev/xvda1 / ext4 rw 0 0\n").unwrap();

        let host = LinuxHost::new(LinuxHostConfig {
            mount_table: table,
            ..Default::default()
        });

        let contents = host.read_mount_table().await.unwrap();
        assert!(contents.contains("/dev/xvda1"));
    }

    #[tokio::test]
    async fn test_create_dir_all_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("srv/data");
        let host = LinuxHost::default();

        host.create_dir_all(&target).await.unwrap();
        host.create_dir_all(&target).await.unwrap();
        assert!(target.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&target).unwrap().permissions().mode();
            // umask may only remove bits
            assert_eq!(mode & 0o022, 0);
        }
    }

    #[tokio::test]
    async fn test_missing_command_is_reported() {
        let host = LinuxHost::new(LinuxHostConfig {
            mkfs_command: PathBuf::from("/nonexistent/mkfs.ext4"),
            ..Default::default()
        });

        let result = host.format(Path::new("/dev/xvdb"), 16384).await;
        assert_matches!(result, Err(Error::Command { command, .. }) if command == "/nonexistent/mkfs.ext4");
    }
}
