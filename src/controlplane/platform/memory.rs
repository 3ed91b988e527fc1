//! In-memory Control Plane
//!
//! Models the block-storage control plane closely enough to drive the
//! whole acquisition sequence without a cloud account:
//! - volumes move `creating -> available -> in-use` as they are polled
//! - an attach against a contended volume loses the race to another
//!   instance, which leaves the volume `in-use` for good
//! - attachments make the device node appear on the shared
//!   [`DeviceNodes`]
//! - every call is logged so tests can assert what was (not) mutated

use crate::domain::ports::{
    device_path, AttachmentRequest, ControlPlane, CreateVolumeRequest, Snapshot, SnapshotFilter,
    Tags, Volume, VolumeFilter, VolumeState, OWNER_SELF,
};
use crate::error::{Error, Result};
use crate::host::memory::DeviceNodes;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Instance that wins every contended attach
pub const CONTENDING_INSTANCE: &str = "i-contender";

/// Account the in-memory control plane treats as the caller's own
pub const LOCAL_ACCOUNT: &str = "111122223333";

// =============================================================================
// Recorded Calls
// =============================================================================

/// A call made against the in-memory control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneCall {
    DescribeVolumes,
    DescribeSnapshots,
    CreateVolume {
        volume_id: String,
        snapshot_id: Option<String>,
    },
    CreateTags {
        resource_id: String,
        tags: Tags,
    },
    AttachVolume {
        volume_id: String,
        device_name: String,
    },
    SetDeleteOnTermination {
        volume_id: String,
    },
}

impl ControlPlaneCall {
    /// Whether the call changes control-plane state
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            ControlPlaneCall::DescribeVolumes | ControlPlaneCall::DescribeSnapshots
        )
    }
}

// =============================================================================
// Internal State
// =============================================================================

/// Attachment of a volume to an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub instance_id: String,
    pub device_name: String,
    pub delete_on_termination: bool,
}

#[derive(Debug, Clone)]
struct VolumeRecord {
    volume: Volume,
    /// Polls left before a `creating` volume turns `available`
    polls_until_available: u32,
    /// Polls left before an attaching volume turns `in-use`
    polls_until_in_use: Option<u32>,
    /// Describe calls left before the volume shows up in results
    hidden_polls: u32,
    attachment: Option<Attachment>,
}

#[derive(Debug, Default)]
struct Faults {
    contended: BTreeSet<String>,
    fail_queries: bool,
    fail_create: bool,
    fail_create_tags: bool,
    fail_delete_on_termination: bool,
    never_available: bool,
    suppress_device_nodes: bool,
}

#[derive(Debug, Default)]
struct CloudState {
    volumes: BTreeMap<String, VolumeRecord>,
    snapshots: Vec<Snapshot>,
    calls: Vec<ControlPlaneCall>,
    faults: Faults,
    next_id: u64,
    creation_polls: u32,
    attach_polls: u32,
    describe_lag: u32,
}

impl CloudState {
    /// Advance every transitional volume by one poll
    fn tick(&mut self, device_nodes: &DeviceNodes) {
        let never_available = self.faults.never_available;
        let suppress_device_nodes = self.faults.suppress_device_nodes;

        for record in self.volumes.values_mut() {
            if record.volume.state == VolumeState::Creating && !never_available {
                if record.polls_until_available == 0 {
                    record.volume.state = VolumeState::Available;
                } else {
                    record.polls_until_available -= 1;
                }
            }

            if let Some(polls) = record.polls_until_in_use {
                if polls == 0 {
                    record.polls_until_in_use = None;
                    record.volume.state = VolumeState::InUse;
                    if let Some(attachment) = &record.attachment {
                        if !suppress_device_nodes {
                            device_nodes.insert(device_path(&attachment.device_name));
                        }
                    }
                } else {
                    record.polls_until_in_use = Some(polls - 1);
                }
            }
        }
    }
}

fn api_error(operation: &str, reason: impl Into<String>) -> Error {
    Error::ControlPlane {
        operation: operation.to_string(),
        reason: reason.into(),
    }
}

// =============================================================================
// In-memory Control Plane
// =============================================================================

/// Control plane keeping volumes and snapshots in memory
#[derive(Debug, Default)]
pub struct InMemoryControlPlane {
    state: Mutex<CloudState>,
    device_nodes: DeviceNodes,
}

impl InMemoryControlPlane {
    /// Create a control plane whose attachments appear on `device_nodes`
    pub fn new(device_nodes: DeviceNodes) -> Self {
        Self {
            state: Mutex::new(CloudState {
                creation_polls: 1,
                attach_polls: 1,
                ..Default::default()
            }),
            device_nodes,
        }
    }

    pub fn device_nodes(&self) -> &DeviceNodes {
        &self.device_nodes
    }

    // -------------------------------------------------------------------------
    // Seeding
    // -------------------------------------------------------------------------

    /// Add an existing volume
    pub fn add_volume(&self, volume: Volume) {
        let record = VolumeRecord {
            volume: volume.clone(),
            polls_until_available: 0,
            polls_until_in_use: None,
            hidden_polls: 0,
            attachment: None,
        };
        self.state.lock().volumes.insert(volume.volume_id, record);
    }

    /// Add an existing snapshot
    pub fn add_snapshot(&self, snapshot: Snapshot) {
        self.state.lock().snapshots.push(snapshot);
    }

    /// Polls a new volume spends in `creating`
    pub fn set_creation_polls(&self, polls: u32) {
        self.state.lock().creation_polls = polls;
    }

    /// Polls an attaching volume spends before `in-use`
    pub fn set_attach_polls(&self, polls: u32) {
        self.state.lock().attach_polls = polls;
    }

    /// Describe calls a new volume stays invisible for
    pub fn set_describe_lag(&self, polls: u32) {
        self.state.lock().describe_lag = polls;
    }

    // -------------------------------------------------------------------------
    // Fault Injection
    // -------------------------------------------------------------------------

    /// Another instance grabs this volume as soon as we try to attach it
    pub fn contend_volume(&self, volume_id: &str) {
        self.state.lock().faults.contended.insert(volume_id.to_string());
    }

    pub fn fail_queries(&self, fail: bool) {
        self.state.lock().faults.fail_queries = fail;
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().faults.fail_create = fail;
    }

    pub fn fail_create_tags(&self, fail: bool) {
        self.state.lock().faults.fail_create_tags = fail;
    }

    pub fn fail_delete_on_termination(&self, fail: bool) {
        self.state.lock().faults.fail_delete_on_termination = fail;
    }

    /// New volumes stay `creating` forever
    pub fn never_available(&self) {
        self.state.lock().faults.never_available = true;
    }

    /// Attachments complete but the OS never shows the device node
    pub fn suppress_device_nodes(&self) {
        self.state.lock().faults.suppress_device_nodes = true;
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn volume(&self, volume_id: &str) -> Option<Volume> {
        self.state
            .lock()
            .volumes
            .get(volume_id)
            .map(|r| r.volume.clone())
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.state
            .lock()
            .volumes
            .values()
            .map(|r| r.volume.clone())
            .collect()
    }

    pub fn attachment(&self, volume_id: &str) -> Option<Attachment> {
        self.state
            .lock()
            .volumes
            .get(volume_id)
            .and_then(|r| r.attachment.clone())
    }

    pub fn calls(&self) -> Vec<ControlPlaneCall> {
        self.state.lock().calls.clone()
    }

    /// Number of state-changing calls made so far
    pub fn mutation_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .count()
    }

    /// Volumes created through this control plane
    pub fn created_volumes(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                ControlPlaneCall::CreateVolume { volume_id, .. } => Some(volume_id.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn describe_volumes(&self, filter: &VolumeFilter) -> Result<Vec<Volume>> {
        let mut state = self.state.lock();
        state.calls.push(ControlPlaneCall::DescribeVolumes);
        if state.faults.fail_queries {
            return Err(api_error("DescribeVolumes", "RequestLimitExceeded"));
        }

        state.tick(&self.device_nodes);

        let volumes = state
            .volumes
            .values()
            .filter(|r| r.hidden_polls == 0)
            .map(|r| &r.volume)
            .filter(|v| filter.matches(v))
            .cloned()
            .collect();
        for record in state.volumes.values_mut() {
            record.hidden_polls = record.hidden_polls.saturating_sub(1);
        }
        Ok(volumes)
    }

    async fn describe_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>> {
        let mut state = self.state.lock();
        state.calls.push(ControlPlaneCall::DescribeSnapshots);
        if state.faults.fail_queries {
            return Err(api_error("DescribeSnapshots", "RequestLimitExceeded"));
        }

        let mut filter = filter.clone();
        for owner in filter.owner_ids.iter_mut() {
            if owner == OWNER_SELF {
                *owner = LOCAL_ACCOUNT.to_string();
            }
        }

        Ok(state
            .snapshots
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn create_volume(
        &self,
        availability_zone: &str,
        request: &CreateVolumeRequest,
    ) -> Result<String> {
        let mut state = self.state.lock();
        if state.faults.fail_create {
            return Err(api_error("CreateVolume", "VolumeLimitExceeded"));
        }
        if let Some(snapshot_id) = &request.snapshot_id {
            if !state.snapshots.iter().any(|s| &s.snapshot_id == snapshot_id) {
                return Err(api_error(
                    "CreateVolume",
                    format!("InvalidSnapshot.NotFound: {}", snapshot_id),
                ));
            }
        }

        state.next_id += 1;
        let volume_id = format!("vol-{:017x}", state.next_id);
        debug!(
            "Creating in-memory volume {} ({} GiB, {}) in {}",
            volume_id, request.size_gib, request.volume_type, availability_zone
        );

        let record = VolumeRecord {
            volume: Volume {
                volume_id: volume_id.clone(),
                availability_zone: availability_zone.to_string(),
                state: VolumeState::Creating,
                tags: Tags::new(),
            },
            polls_until_available: state.creation_polls,
            polls_until_in_use: None,
            hidden_polls: state.describe_lag,
            attachment: None,
        };
        state.volumes.insert(volume_id.clone(), record);
        state.calls.push(ControlPlaneCall::CreateVolume {
            volume_id: volume_id.clone(),
            snapshot_id: request.snapshot_id.clone(),
        });

        Ok(volume_id)
    }

    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(ControlPlaneCall::CreateTags {
            resource_id: resource_id.to_string(),
            tags: tags.clone(),
        });
        if state.faults.fail_create_tags {
            return Err(api_error("CreateTags", "RequestLimitExceeded"));
        }

        if let Some(record) = state.volumes.get_mut(resource_id) {
            record.volume.tags.extend(tags.clone());
            return Ok(());
        }
        if let Some(snapshot) = state
            .snapshots
            .iter_mut()
            .find(|s| s.snapshot_id == resource_id)
        {
            snapshot.tags.extend(tags.clone());
            return Ok(());
        }
        Err(api_error(
            "CreateTags",
            format!("InvalidID: {}", resource_id),
        ))
    }

    async fn attach_volume(&self, request: &AttachmentRequest, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(ControlPlaneCall::AttachVolume {
            volume_id: request.volume_id.clone(),
            device_name: request.device_name.clone(),
        });

        let contended = state.faults.contended.contains(&request.volume_id);
        let attach_polls = state.attach_polls;
        let record = state.volumes.get_mut(&request.volume_id).ok_or_else(|| {
            api_error(
                "AttachVolume",
                format!("InvalidVolume.NotFound: {}", request.volume_id),
            )
        })?;

        if record.volume.state != VolumeState::Available {
            return Err(api_error(
                "AttachVolume",
                format!(
                    "IncorrectState: {} is {}",
                    request.volume_id, record.volume.state
                ),
            ));
        }

        if contended {
            record.volume.state = VolumeState::InUse;
            record.attachment = Some(Attachment {
                instance_id: CONTENDING_INSTANCE.to_string(),
                device_name: request.device_name.clone(),
                delete_on_termination: false,
            });
            return Err(api_error(
                "AttachVolume",
                format!("VolumeInUse: {} is already attached", request.volume_id),
            ));
        }

        record.attachment = Some(Attachment {
            instance_id: instance_id.to_string(),
            device_name: request.device_name.clone(),
            delete_on_termination: false,
        });
        record.polls_until_in_use = Some(attach_polls);
        Ok(())
    }

    async fn set_delete_on_termination(
        &self,
        instance_id: &str,
        device_name: &str,
        volume_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(ControlPlaneCall::SetDeleteOnTermination {
            volume_id: volume_id.to_string(),
        });
        if state.faults.fail_delete_on_termination {
            return Err(api_error("ModifyInstanceAttribute", "UnauthorizedOperation"));
        }

        let attachment = state
            .volumes
            .get_mut(volume_id)
            .and_then(|r| r.attachment.as_mut())
            .filter(|a| a.instance_id == instance_id && a.device_name == device_name)
            .ok_or_else(|| {
                api_error(
                    "ModifyInstanceAttribute",
                    format!("no device {} with volume {} on {}", device_name, volume_id, instance_id),
                )
            })?;
        attachment.delete_on_termination = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeType;
    use std::path::Path;

    fn request(snapshot_id: Option<&str>) -> CreateVolumeRequest {
        CreateVolumeRequest {
            size_gib: 20,
            name: "data".into(),
            volume_type: VolumeType::Gp2,
            tags: Tags::new(),
            snapshot_id: snapshot_id.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_volume_lifecycle() {
        let nodes = DeviceNodes::new();
        let cloud = InMemoryControlPlane::new(nodes.clone());

        let volume_id = cloud.create_volume("us-east-1a", &request(None)).await.unwrap();
        assert_eq!(cloud.volume(&volume_id).unwrap().state, VolumeState::Creating);

        // creation_polls = 1: one poll stays creating, the next is available
        cloud.describe_volumes(&VolumeFilter::by_id(&volume_id)).await.unwrap();
        let volumes = cloud.describe_volumes(&VolumeFilter::by_id(&volume_id)).await.unwrap();
        assert_eq!(volumes[0].state, VolumeState::Available);

        let attach = AttachmentRequest {
            volume_id: volume_id.clone(),
            device_name: "xvdb".into(),
            delete_on_termination: false,
        };
        cloud.attach_volume(&attach, "i-local").await.unwrap();
        assert!(!nodes.contains(Path::new("/dev/xvdb")));

        cloud.describe_volumes(&VolumeFilter::by_id(&volume_id)).await.unwrap();
        let volumes = cloud.describe_volumes(&VolumeFilter::by_id(&volume_id)).await.unwrap();
        assert_eq!(volumes[0].state, VolumeState::InUse);
        assert!(nodes.contains(Path::new("/dev/xvdb")));

        cloud
            .set_delete_on_termination("i-local", "xvdb", &volume_id)
            .await
            .unwrap();
        assert!(cloud.attachment(&volume_id).unwrap().delete_on_termination);
    }

    #[tokio::test]
    async fn test_contended_attach_loses_volume() {
        let cloud = InMemoryControlPlane::new(DeviceNodes::new());
        cloud.add_volume(Volume {
            volume_id: "vol-1".into(),
            availability_zone: "us-east-1a".into(),
            state: VolumeState::Available,
            tags: Tags::new(),
        });
        cloud.contend_volume("vol-1");

        let attach = AttachmentRequest {
            volume_id: "vol-1".into(),
            device_name: "xvdb".into(),
            delete_on_termination: false,
        };
        assert!(cloud.attach_volume(&attach, "i-local").await.is_err());

        let volume = cloud.volume("vol-1").unwrap();
        assert_eq!(volume.state, VolumeState::InUse);
        assert_eq!(
            cloud.attachment("vol-1").unwrap().instance_id,
            CONTENDING_INSTANCE
        );
    }

    #[tokio::test]
    async fn test_restore_requires_known_snapshot() {
        let cloud = InMemoryControlPlane::new(DeviceNodes::new());
        let result = cloud.create_volume("us-east-1a", &request(Some("snap-missing"))).await;
        assert!(result.is_err());
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_create_tags_merges() {
        let cloud = InMemoryControlPlane::new(DeviceNodes::new());
        let volume_id = cloud.create_volume("us-east-1a", &request(None)).await.unwrap();

        let mut tags = Tags::new();
        tags.insert("filesystem".into(), "false".into());
        cloud.create_tags(&volume_id, &tags).await.unwrap();
        tags.insert("filesystem".into(), "true".into());
        cloud.create_tags(&volume_id, &tags).await.unwrap();

        let volume = cloud.volume(&volume_id).unwrap();
        assert_eq!(volume.tags.get("filesystem").map(String::as_str), Some("true"));
        assert_eq!(cloud.mutation_count(), 3);
    }
}
