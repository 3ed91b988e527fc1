//! Domain Ports - Core trait definitions for the volume provisioner
//!
//! These traits define the boundaries between the acquisition logic and
//! the systems it drives: the cloud block-storage control plane, the
//! local host, and the operation set the orchestrator sequences.

use crate::config::VolumeType;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Tag set of a volume or snapshot
pub type Tags = BTreeMap<String, String>;

/// Tag marking whether a volume already carries a filesystem
pub const FILESYSTEM_TAG: &str = "filesystem";

/// Display-name tag, also the key snapshots are looked up by
pub const NAME_TAG: &str = "Name";

/// Owner alias for the caller's own account
pub const OWNER_SELF: &str = "self";

// =============================================================================
// Instance Context
// =============================================================================

/// Identity of the local instance, resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceContext {
    pub region: String,
    pub availability_zone: String,
    pub instance_id: String,
}

// =============================================================================
// Volumes
// =============================================================================

/// Volume lifecycle state as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
}

impl VolumeState {
    /// Parse the control plane's wire name
    pub fn from_api(state: &str) -> Option<Self> {
        match state {
            "creating" => Some(VolumeState::Creating),
            "available" => Some(VolumeState::Available),
            "in-use" => Some(VolumeState::InUse),
            "deleting" => Some(VolumeState::Deleting),
            "deleted" => Some(VolumeState::Deleted),
            "error" => Some(VolumeState::Error),
            _ => None,
        }
    }

    /// States a volume never leaves on its own
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            VolumeState::Deleting | VolumeState::Deleted | VolumeState::Error
        )
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeState::Creating => write!(f, "creating"),
            VolumeState::Available => write!(f, "available"),
            VolumeState::InUse => write!(f, "in-use"),
            VolumeState::Deleting => write!(f, "deleting"),
            VolumeState::Deleted => write!(f, "deleted"),
            VolumeState::Error => write!(f, "error"),
        }
    }
}

/// A block-storage volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: String,
    pub availability_zone: String,
    pub state: VolumeState,
    pub tags: Tags,
}

impl Volume {
    /// Whether another instance may pick this volume up without formatting it
    pub fn is_reusable_in(&self, availability_zone: &str) -> bool {
        self.state == VolumeState::Available
            && self.availability_zone == availability_zone
            && self.tags.get(FILESYSTEM_TAG).map(String::as_str) == Some("true")
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Snapshot lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
}

impl SnapshotState {
    /// Parse the control plane's wire name
    pub fn from_api(state: &str) -> Option<Self> {
        match state {
            "pending" => Some(SnapshotState::Pending),
            "completed" => Some(SnapshotState::Completed),
            "error" => Some(SnapshotState::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotState::Pending => write!(f, "pending"),
            SnapshotState::Completed => write!(f, "completed"),
            SnapshotState::Error => write!(f, "error"),
        }
    }
}

/// A point-in-time copy of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    /// Account owning the snapshot
    pub owner_id: String,
    pub start_time: DateTime<Utc>,
    pub state: SnapshotState,
    pub tags: Tags,
}

// =============================================================================
// Queries
// =============================================================================

/// Tag key/value pair used for discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagQuery {
    pub key: String,
    pub value: String,
}

impl TagQuery {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Filter name understood by the control plane
    pub fn filter_name(&self) -> String {
        format!("tag:{}", self.key)
    }

    fn matches(&self, tags: &Tags) -> bool {
        tags.get(&self.key) == Some(&self.value)
    }
}

impl std::fmt::Display for TagQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tag:{}={}", self.key, self.value)
    }
}

/// Filter for describe-volumes; empty fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeFilter {
    pub volume_ids: Vec<String>,
    pub tags: Vec<TagQuery>,
    pub state: Option<VolumeState>,
    pub availability_zone: Option<String>,
}

impl VolumeFilter {
    /// Filter selecting a single volume by id
    pub fn by_id(volume_id: &str) -> Self {
        Self {
            volume_ids: vec![volume_id.to_string()],
            ..Default::default()
        }
    }

    pub fn matches(&self, volume: &Volume) -> bool {
        (self.volume_ids.is_empty() || self.volume_ids.contains(&volume.volume_id))
            && self.tags.iter().all(|t| t.matches(&volume.tags))
            && self.state.map_or(true, |s| s == volume.state)
            && self
                .availability_zone
                .as_ref()
                .map_or(true, |az| *az == volume.availability_zone)
    }
}

/// Filter for describe-snapshots; empty fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub tags: Vec<TagQuery>,
    pub state: Option<SnapshotState>,
    /// Owning accounts; [`OWNER_SELF`] stands for the caller's account
    pub owner_ids: Vec<String>,
}

impl SnapshotFilter {
    /// Match against a snapshot, with `OWNER_SELF` already resolved
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        self.tags.iter().all(|t| t.matches(&snapshot.tags))
            && self.state.map_or(true, |s| s == snapshot.state)
            && (self.owner_ids.is_empty() || self.owner_ids.contains(&snapshot.owner_id))
    }
}

// =============================================================================
// Creation / Attachment Requests
// =============================================================================

/// Parameters for creating a new volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Size in GiB
    pub size_gib: u32,
    /// Value of the `Name` tag
    pub name: String,
    pub volume_type: VolumeType,
    /// Caller-supplied tags applied after creation
    pub tags: Tags,
    /// Snapshot to restore from
    pub snapshot_id: Option<String>,
}

/// Attach request for the local instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRequest {
    pub volume_id: String,
    /// Device name, e.g. `xvdb`
    pub device_name: String,
    pub delete_on_termination: bool,
}

impl AttachmentRequest {
    /// Device node the OS exposes for this attachment
    pub fn device_path(&self) -> PathBuf {
        device_path(&self.device_name)
    }
}

/// `/dev/{device_name}`
pub fn device_path(device_name: &str) -> PathBuf {
    Path::new("/dev").join(device_name)
}

// =============================================================================
// Control Plane Port
// =============================================================================

/// Port for the cloud block-storage control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Describe volumes matching a filter
    async fn describe_volumes(&self, filter: &VolumeFilter) -> Result<Vec<Volume>>;

    /// Describe snapshots matching a filter, in the control plane's order
    async fn describe_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>>;

    /// Create a volume in a zone, without tags
    async fn create_volume(
        &self,
        availability_zone: &str,
        request: &CreateVolumeRequest,
    ) -> Result<String>;

    /// Add or overwrite tags on a resource
    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> Result<()>;

    /// Issue an attach request
    async fn attach_volume(&self, request: &AttachmentRequest, instance_id: &str) -> Result<()>;

    /// Mark an attached device for deletion when the instance terminates
    async fn set_delete_on_termination(
        &self,
        instance_id: &str,
        device_name: &str,
        volume_id: &str,
    ) -> Result<()>;
}

// =============================================================================
// Host Port
// =============================================================================

/// Port for local operating-system primitives
#[async_trait]
pub trait HostSystem: Send + Sync {
    /// Whether a path exists (errors other than "not found" are returned)
    async fn path_exists(&self, path: &Path) -> Result<bool>;

    /// Raw contents of the mount table
    async fn read_mount_table(&self) -> Result<String>;

    /// Create a directory tree
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Mount a device on a directory
    async fn mount(&self, device: &Path, mount_point: &Path) -> Result<()>;

    /// Create a filesystem on a raw device
    async fn format(&self, device: &Path, inode_ratio: u64) -> Result<()>;
}

// =============================================================================
// Volume Operations Port
// =============================================================================

/// The operation set the orchestrator sequences
#[async_trait]
pub trait VolumeOperations: Send + Sync {
    /// Fail if the device node already exists
    async fn check_device(&self, device: &Path) -> Result<()>;

    /// Fail if the mount point already shows up in the mount table
    async fn check_mount_point(&self, mount_point: &Path) -> Result<()>;

    /// Find an available, formatted volume in the local zone
    async fn find_volume(&self, query: &TagQuery) -> Result<Option<String>>;

    /// Find the newest completed snapshot
    async fn find_snapshot(&self, query: &TagQuery) -> Result<Option<String>>;

    /// Create and tag a volume
    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<String>;

    /// Wait until a volume is available
    async fn wait_until_volume_available(&self, volume_id: &str) -> Result<()>;

    /// Attach a volume and wait for its device node
    async fn attach_volume(&self, request: &AttachmentRequest) -> Result<()>;

    /// Format a device and mark the volume as carrying a filesystem
    async fn make_file_system(&self, device: &Path, inode_ratio: u64, volume_id: &str)
        -> Result<()>;

    /// Create the mount point and mount the device
    async fn mount_volume(&self, device: &Path, mount_point: &Path) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeOperationsRef = Arc<dyn VolumeOperations>;

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(state: VolumeState, az: &str, filesystem: &str) -> Volume {
        let mut tags = Tags::new();
        tags.insert("env".into(), "prod".into());
        tags.insert(FILESYSTEM_TAG.into(), filesystem.into());
        Volume {
            volume_id: "vol-1".into(),
            availability_zone: az.into(),
            state,
            tags,
        }
    }

    #[test]
    fn test_volume_state_round_trip_names() {
        for state in [
            VolumeState::Creating,
            VolumeState::Available,
            VolumeState::InUse,
            VolumeState::Deleting,
            VolumeState::Deleted,
            VolumeState::Error,
        ] {
            assert_eq!(VolumeState::from_api(&state.to_string()), Some(state));
        }
        assert_eq!(VolumeState::from_api("optimizing"), None);
    }

    #[test]
    fn test_reusable_volume() {
        assert!(volume(VolumeState::Available, "us-east-1a", "true").is_reusable_in("us-east-1a"));
        assert!(!volume(VolumeState::Available, "us-east-1b", "true").is_reusable_in("us-east-1a"));
        assert!(!volume(VolumeState::InUse, "us-east-1a", "true").is_reusable_in("us-east-1a"));
        assert!(!volume(VolumeState::Available, "us-east-1a", "false").is_reusable_in("us-east-1a"));
    }

    #[test]
    fn test_volume_filter() {
        let vol = volume(VolumeState::Available, "us-east-1a", "true");

        assert!(VolumeFilter::default().matches(&vol));
        assert!(VolumeFilter::by_id("vol-1").matches(&vol));
        assert!(!VolumeFilter::by_id("vol-2").matches(&vol));

        let filter = VolumeFilter {
            tags: vec![TagQuery::new("env", "prod"), TagQuery::new(FILESYSTEM_TAG, "true")],
            state: Some(VolumeState::Available),
            availability_zone: Some("us-east-1a".into()),
            ..Default::default()
        };
        assert!(filter.matches(&vol));

        let filter = VolumeFilter {
            tags: vec![TagQuery::new("env", "staging")],
            ..Default::default()
        };
        assert!(!filter.matches(&vol));
    }

    #[test]
    fn test_tag_query_display() {
        let query = TagQuery::new("env", "prod");
        assert_eq!(query.to_string(), "tag:env=prod");
        assert_eq!(query.filter_name(), "tag:env");
    }

    #[test]
    fn test_device_path() {
        let request = AttachmentRequest {
            volume_id: "vol-1".into(),
            device_name: "xvdb".into(),
            delete_on_termination: false,
        };
        assert_eq!(request.device_path(), PathBuf::from("/dev/xvdb"));
    }
}
