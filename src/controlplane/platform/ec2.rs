//! EC2 Control Plane Adapter
//!
//! Provides the block-storage control plane on AWS:
//! - EBS volume and snapshot discovery
//! - Volume creation and tagging
//! - Attachment and block-device-mapping updates

use crate::domain::ports::{
    AttachmentRequest, ControlPlane, CreateVolumeRequest, InstanceContext, Snapshot,
    SnapshotFilter, SnapshotState, Tags, TagQuery, Volume, VolumeFilter, VolumeState,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_sdk_ec2::config::retry::RetryConfig;
use aws_sdk_ec2::config::Region;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::types::{
    EbsInstanceBlockDeviceSpecification, Filter, InstanceBlockDeviceMappingSpecification, Tag,
};
use aws_sdk_ec2::Client;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

// =============================================================================
// Helpers
// =============================================================================

fn sdk_error<E>(operation: &str, err: E) -> Error
where
    E: std::error::Error,
{
    Error::ControlPlane {
        operation: operation.to_string(),
        reason: DisplayErrorContext(err).to_string(),
    }
}

/// Error code EC2 returns for volume ids it does not know (yet)
const VOLUME_NOT_FOUND: &str = "InvalidVolume.NotFound";

/// EC2 is eventually consistent: a volume just returned by CreateVolume can
/// be unknown to DescribeVolumes for a while. A lookup by id that fails this
/// way reads as an empty result.
fn is_unknown_volume_id(volume_filter: &VolumeFilter, code: Option<&str>) -> bool {
    !volume_filter.volume_ids.is_empty() && code == Some(VOLUME_NOT_FOUND)
}

fn filter(name: impl Into<String>, value: impl Into<String>) -> Filter {
    Filter::builder().name(name).values(value).build()
}

fn tag_filters(tags: &[TagQuery]) -> Vec<Filter> {
    tags.iter()
        .map(|t| filter(t.filter_name(), t.value.clone()))
        .collect()
}

fn tags_from(tags: &[Tag]) -> Tags {
    tags.iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
        .collect()
}

fn to_volume(volume: &aws_sdk_ec2::types::Volume) -> Option<Volume> {
    let state = volume.state().and_then(|s| VolumeState::from_api(s.as_str()))?;
    Some(Volume {
        volume_id: volume.volume_id()?.to_string(),
        availability_zone: volume.availability_zone().unwrap_or_default().to_string(),
        state,
        tags: tags_from(volume.tags()),
    })
}

fn to_snapshot(snapshot: &aws_sdk_ec2::types::Snapshot) -> Option<Snapshot> {
    let state = snapshot
        .state()
        .and_then(|s| SnapshotState::from_api(s.as_str()))?;
    let start = snapshot.start_time()?;
    Some(Snapshot {
        snapshot_id: snapshot.snapshot_id()?.to_string(),
        owner_id: snapshot.owner_id().unwrap_or_default().to_string(),
        start_time: DateTime::<Utc>::from_timestamp(start.secs(), start.subsec_nanos())?,
        state,
        tags: tags_from(snapshot.tags()),
    })
}

// =============================================================================
// EC2 Adapter
// =============================================================================

/// Control plane backed by the EC2 API
#[derive(Debug, Clone)]
pub struct Ec2ControlPlane {
    client: Client,
}

impl Ec2ControlPlane {
    /// Connect to EC2 in the instance's region
    ///
    /// `max_retries` is handed to the SDK's own retry policy; the SDK
    /// counts the first try as an attempt.
    pub async fn connect(context: &InstanceContext, max_retries: u32) -> Self {
        info!(
            "Connecting to EC2 in {} (max retries: {})",
            context.region, max_retries
        );

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(context.region.clone()))
            .retry_config(RetryConfig::standard().with_max_attempts(max_retries.saturating_add(1)))
            .load()
            .await;

        Self {
            client: Client::new(&sdk_config),
        }
    }

    /// Wrap an already configured client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ControlPlane for Ec2ControlPlane {
    async fn describe_volumes(&self, volume_filter: &VolumeFilter) -> Result<Vec<Volume>> {
        let mut filters = tag_filters(&volume_filter.tags);
        if let Some(state) = volume_filter.state {
            filters.push(filter("status", state.to_string()));
        }
        if let Some(az) = &volume_filter.availability_zone {
            filters.push(filter("availability-zone", az.clone()));
        }

        let mut request = self.client.describe_volumes();
        if !filters.is_empty() {
            request = request.set_filters(Some(filters));
        }
        if !volume_filter.volume_ids.is_empty() {
            request = request.set_volume_ids(Some(volume_filter.volume_ids.clone()));
        }

        let output = match request.send().await {
            Ok(output) => output,
            Err(e) if is_unknown_volume_id(volume_filter, e.code()) => {
                debug!(
                    "DescribeVolumes does not know {:?} yet",
                    volume_filter.volume_ids
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(sdk_error("DescribeVolumes", e)),
        };

        let volumes: Vec<Volume> = output.volumes().iter().filter_map(to_volume).collect();
        debug!("DescribeVolumes returned {} volumes", volumes.len());
        Ok(volumes)
    }

    async fn describe_snapshots(&self, snapshot_filter: &SnapshotFilter) -> Result<Vec<Snapshot>> {
        let mut filters = tag_filters(&snapshot_filter.tags);
        if let Some(state) = snapshot_filter.state {
            filters.push(filter("status", state.to_string()));
        }

        let mut request = self.client.describe_snapshots().set_filters(Some(filters));
        if !snapshot_filter.owner_ids.is_empty() {
            request = request.set_owner_ids(Some(snapshot_filter.owner_ids.clone()));
        }

        let output = request
            .send()
            .await
            .map_err(|e| sdk_error("DescribeSnapshots", e))?;

        let snapshots: Vec<Snapshot> = output.snapshots().iter().filter_map(to_snapshot).collect();
        debug!("DescribeSnapshots returned {} snapshots", snapshots.len());
        Ok(snapshots)
    }

    async fn create_volume(
        &self,
        availability_zone: &str,
        request: &CreateVolumeRequest,
    ) -> Result<String> {
        let size = i32::try_from(request.size_gib).map_err(|_| Error::Configuration(format!(
            "volume size {} GiB out of range",
            request.size_gib
        )))?;

        let output = self
            .client
            .create_volume()
            .availability_zone(availability_zone)
            .size(size)
            .volume_type(request.volume_type.as_str().into())
            .set_snapshot_id(request.snapshot_id.clone())
            .send()
            .await
            .map_err(|e| sdk_error("CreateVolume", e))?;

        output
            .volume_id()
            .map(String::from)
            .ok_or_else(|| Error::ControlPlane {
                operation: "CreateVolume".into(),
                reason: "response carried no volume id".into(),
            })
    }

    async fn create_tags(&self, resource_id: &str, tags: &Tags) -> Result<()> {
        let tags: Vec<Tag> = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect();

        self.client
            .create_tags()
            .resources(resource_id)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|e| sdk_error("CreateTags", e))?;
        Ok(())
    }

    async fn attach_volume(&self, request: &AttachmentRequest, instance_id: &str) -> Result<()> {
        self.client
            .attach_volume()
            .volume_id(&request.volume_id)
            .device(&request.device_name)
            .instance_id(instance_id)
            .send()
            .await
            .map_err(|e| sdk_error("AttachVolume", e))?;
        Ok(())
    }

    async fn set_delete_on_termination(
        &self,
        instance_id: &str,
        device_name: &str,
        volume_id: &str,
    ) -> Result<()> {
        let mapping = InstanceBlockDeviceMappingSpecification::builder()
            .device_name(device_name)
            .ebs(
                EbsInstanceBlockDeviceSpecification::builder()
                    .delete_on_termination(true)
                    .volume_id(volume_id)
                    .build(),
            )
            .build();

        self.client
            .modify_instance_attribute()
            .instance_id(instance_id)
            .block_device_mappings(mapping)
            .send()
            .await
            .map_err(|e| sdk_error("ModifyInstanceAttribute", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ec2::primitives::DateTime as SmithyDateTime;
    use aws_sdk_ec2::types::{SnapshotState as Ec2SnapshotState, VolumeState as Ec2VolumeState};

    #[test]
    fn test_to_volume() {
        let volume = aws_sdk_ec2::types::Volume::builder()
            .volume_id("vol-0abc")
            .availability_zone("us-east-1a")
            .state(Ec2VolumeState::Available)
            .tags(Tag::builder().key("env").value("prod").build())
            .tags(Tag::builder().key("filesystem").value("true").build())
            .build();

        let converted = to_volume(&volume).unwrap();
        assert_eq!(converted.volume_id, "vol-0abc");
        assert_eq!(converted.state, VolumeState::Available);
        assert!(converted.is_reusable_in("us-east-1a"));
    }

    #[test]
    fn test_to_volume_skips_incomplete_records() {
        let volume = aws_sdk_ec2::types::Volume::builder()
            .state(Ec2VolumeState::Available)
            .build();
        assert!(to_volume(&volume).is_none());
    }

    #[test]
    fn test_to_snapshot() {
        let snapshot = aws_sdk_ec2::types::Snapshot::builder()
            .snapshot_id("snap-1")
            .owner_id("111122223333")
            .state(Ec2SnapshotState::Completed)
            .start_time(SmithyDateTime::from_secs(1_700_000_000))
            .tags(Tag::builder().key("Name").value("nightly-backup").build())
            .build();

        let converted = to_snapshot(&snapshot).unwrap();
        assert_eq!(converted.snapshot_id, "snap-1");
        assert_eq!(converted.owner_id, "111122223333");
        assert_eq!(converted.state, SnapshotState::Completed);
        assert_eq!(converted.start_time.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_unknown_volume_id_reads_as_empty() {
        let by_id = VolumeFilter::by_id("vol-new");
        assert!(is_unknown_volume_id(&by_id, Some("InvalidVolume.NotFound")));
        assert!(!is_unknown_volume_id(&by_id, Some("RequestLimitExceeded")));
        assert!(!is_unknown_volume_id(&by_id, None));

        let by_tag = VolumeFilter {
            tags: vec![TagQuery::new("env", "prod")],
            ..Default::default()
        };
        assert!(!is_unknown_volume_id(&by_tag, Some("InvalidVolume.NotFound")));
    }

    #[test]
    fn test_tag_filters() {
        let filters = tag_filters(&[TagQuery::new("env", "prod")]);
        assert_eq!(filters[0].name(), Some("tag:env"));
        assert_eq!(filters[0].values(), &["prod".to_string()]);
    }
}
