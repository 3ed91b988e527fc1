//! Run configuration
//!
//! The fully resolved, immutable configuration the orchestrator owns for
//! the duration of a run. The command-line front end in `main.rs` builds
//! it; everything here is plain data plus validation.

use crate::domain::ports::{
    device_path, AttachmentRequest, CreateVolumeRequest, TagQuery, Tags, NAME_TAG,
};
use crate::error::{Error, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Default `mkfs.ext4 -i` bytes-per-inode ratio
pub const DEFAULT_INODE_RATIO: u64 = 16384;

/// Default retry budget of the control-plane client
pub const DEFAULT_MAX_RETRIES: u32 = 20;

/// Largest volume the control plane accepts, in GiB
pub const MAX_VOLUME_SIZE_GIB: u32 = 16384;

// =============================================================================
// Volume Type
// =============================================================================

/// Storage performance tier of a created volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    /// Magnetic
    Standard,
    /// General purpose SSD
    Gp2,
    /// General purpose SSD, provisioned baseline
    Gp3,
}

impl VolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeType::Standard => "standard",
            VolumeType::Gp2 => "gp2",
            VolumeType::Gp3 => "gp3",
        }
    }
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Timeouts
// =============================================================================

/// Deadlines and polling intervals of the blocking waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline for a new volume to become available
    pub volume_available: Duration,
    /// Deadline for an attached volume to report in-use
    pub volume_in_use: Duration,
    /// Deadline for the device node to appear
    pub device_node: Duration,
    /// Re-check interval for control-plane state
    pub control_plane_poll: Duration,
    /// Re-check interval for the device node
    pub device_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            volume_available: Duration::from_secs(600),
            volume_in_use: Duration::from_secs(600),
            device_node: Duration::from_secs(60),
            control_plane_poll: Duration::from_secs(5),
            device_poll: Duration::from_millis(250),
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Fully resolved run configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Discovery filter
    pub tag: TagQuery,
    /// Device name to attach as, e.g. `xvdb`
    pub attach_as: String,
    pub mount_point: PathBuf,
    pub create_size_gib: u32,
    pub create_name: String,
    pub create_volume_type: VolumeType,
    pub create_tags: Tags,
    pub mkfs_inode_ratio: u64,
    pub delete_on_termination: bool,
    /// Presence switches discovery from volume reuse to snapshot restore
    pub snapshot_name: Option<String>,
    pub max_retries: u32,
    pub timeouts: Timeouts,
}

impl Config {
    /// Create a configuration with defaults for every optional setting
    pub fn new(
        tag: TagQuery,
        attach_as: impl Into<String>,
        mount_point: impl Into<PathBuf>,
        create_size_gib: u32,
        create_name: impl Into<String>,
        create_volume_type: VolumeType,
    ) -> Self {
        Self {
            tag,
            attach_as: attach_as.into(),
            mount_point: mount_point.into(),
            create_size_gib,
            create_name: create_name.into(),
            create_volume_type,
            create_tags: Tags::new(),
            mkfs_inode_ratio: DEFAULT_INODE_RATIO,
            delete_on_termination: false,
            snapshot_name: None,
            max_retries: DEFAULT_MAX_RETRIES,
            timeouts: Timeouts::default(),
        }
    }

    /// Check the invariants the command line cannot express
    pub fn validate(&self) -> Result<()> {
        if self.tag.key.is_empty() || self.tag.value.is_empty() {
            return Err(Error::Configuration(
                "tag key and tag value must not be empty".into(),
            ));
        }
        if self.attach_as.is_empty() || self.attach_as.contains('/') {
            return Err(Error::Configuration(format!(
                "attach-as must be a bare device name like xvdb, got '{}'",
                self.attach_as
            )));
        }
        if self.mount_point.as_os_str().is_empty() {
            return Err(Error::Configuration("mount point must not be empty".into()));
        }
        if self.create_size_gib == 0 || self.create_size_gib > MAX_VOLUME_SIZE_GIB {
            return Err(Error::Configuration(format!(
                "create size must be between 1 and {} GiB, got {}",
                MAX_VOLUME_SIZE_GIB, self.create_size_gib
            )));
        }
        if self.create_name.is_empty() {
            return Err(Error::Configuration("create name must not be empty".into()));
        }
        if self.mkfs_inode_ratio == 0 {
            return Err(Error::Configuration("mkfs inode ratio must be positive".into()));
        }
        if self.snapshot_name.as_deref() == Some("") {
            return Err(Error::Configuration("snapshot name must not be empty".into()));
        }
        Ok(())
    }

    /// Device node of the attached volume
    pub fn device_path(&self) -> PathBuf {
        device_path(&self.attach_as)
    }

    /// Snapshot lookup, if a snapshot name is configured
    pub fn snapshot_query(&self) -> Option<TagQuery> {
        self.snapshot_name
            .as_ref()
            .map(|name| TagQuery::new(NAME_TAG, name.clone()))
    }

    /// Attach request for a volume
    pub fn attachment(&self, volume_id: &str) -> AttachmentRequest {
        AttachmentRequest {
            volume_id: volume_id.to_string(),
            device_name: self.attach_as.clone(),
            delete_on_termination: self.delete_on_termination,
        }
    }

    /// Creation request, optionally restoring a snapshot
    pub fn create_request(&self, snapshot_id: Option<String>) -> CreateVolumeRequest {
        CreateVolumeRequest {
            size_gib: self.create_size_gib,
            name: self.create_name.clone(),
            volume_type: self.create_volume_type,
            tags: self.create_tags.clone(),
            snapshot_id,
        }
    }
}

/// Parse a `KEY=VALUE` tag argument
pub fn parse_tag(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE got '{}'", s)),
    }
}
