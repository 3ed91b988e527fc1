//! Volume Attacher
//!
//! Attaches a volume to the local instance and blocks until the OS shows
//! the device node. Each step depends on the previous one:
//! 1. attach request
//! 2. control plane reports `in-use`
//! 3. delete-on-termination, when requested
//! 4. `/dev/{device}` exists

use crate::config::Timeouts;
use crate::domain::ports::{AttachmentRequest, ControlPlane, HostSystem, InstanceContext, VolumeState};
use crate::error::{Error, Result};
use crate::provision::waiter::{poll_until, AvailabilityWaiter};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Attaches volumes to the local instance
pub struct VolumeAttacher;

impl VolumeAttacher {
    /// Attach `request.volume_id` as `request.device_name`
    ///
    /// Failures are reported once and never retried here.
    pub async fn attach_volume(
        control_plane: &dyn ControlPlane,
        host: &dyn HostSystem,
        context: &InstanceContext,
        request: &AttachmentRequest,
        timeouts: &Timeouts,
    ) -> Result<()> {
        let attach_error = |e: Error| Error::Attach {
            volume_id: request.volume_id.clone(),
            device: request.device_name.clone(),
            reason: e.to_string(),
        };

        info!(
            "Attaching volume {} to {} as {}",
            request.volume_id, context.instance_id, request.device_name
        );
        control_plane
            .attach_volume(request, &context.instance_id)
            .await
            .map_err(attach_error)?;

        AvailabilityWaiter::wait_for_state(
            control_plane,
            &request.volume_id,
            VolumeState::InUse,
            timeouts.volume_in_use,
            timeouts.control_plane_poll,
        )
        .await
        .map_err(attach_error)?;

        if request.delete_on_termination {
            debug!(
                "Setting delete-on-termination for {} on {}",
                request.device_name, context.instance_id
            );
            control_plane
                .set_delete_on_termination(
                    &context.instance_id,
                    &request.device_name,
                    &request.volume_id,
                )
                .await
                .map_err(attach_error)?;
        }

        Self::wait_for_device(
            host,
            &request.device_path(),
            timeouts.device_node,
            timeouts.device_poll,
        )
        .await?;

        info!("Volume {} attached as {}", request.volume_id, request.device_name);
        Ok(())
    }

    /// Poll until the device node exists
    pub async fn wait_for_device(
        host: &dyn HostSystem,
        device: &Path,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        let found = poll_until(timeout, interval, || async move {
            let exists = match host.path_exists(device).await {
                Ok(exists) => exists,
                Err(e) => {
                    debug!("Checking {} failed: {}", device.display(), e);
                    false
                }
            };
            Ok::<_, Error>(exists)
        })
        .await?;

        if found {
            Ok(())
        } else {
            Err(Error::DeviceNotFound {
                device: device.to_path_buf(),
                waited: timeout,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::platform::memory::InMemoryControlPlane;
    use crate::domain::ports::{Tags, Volume};
    use crate::host::memory::{DeviceNodes, FakeHost};
    use assert_matches::assert_matches;

    fn context() -> InstanceContext {
        InstanceContext {
            region: "us-east-1".into(),
            availability_zone: "us-east-1a".into(),
            instance_id: "i-local".into(),
        }
    }

    fn timeouts() -> Timeouts {
        Timeouts {
            volume_available: Duration::from_secs(30),
            volume_in_use: Duration::from_secs(30),
            device_node: Duration::from_secs(60),
            control_plane_poll: Duration::from_millis(10),
            device_poll: Duration::from_millis(10),
        }
    }

    fn setup() -> (InMemoryControlPlane, FakeHost) {
        let nodes = DeviceNodes::new();
        let cloud = InMemoryControlPlane::new(nodes.clone());
        cloud.add_volume(Volume {
            volume_id: "vol-1".into(),
            availability_zone: "us-east-1a".into(),
            state: VolumeState::Available,
            tags: Tags::new(),
        });
        (cloud, FakeHost::new(nodes))
    }

    fn request(delete_on_termination: bool) -> AttachmentRequest {
        AttachmentRequest {
            volume_id: "vol-1".into(),
            device_name: "xvdb".into(),
            delete_on_termination,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_waits_for_device() {
        let (cloud, host) = setup();

        VolumeAttacher::attach_volume(&cloud, &host, &context(), &request(false), &timeouts())
            .await
            .unwrap();

        assert_eq!(cloud.volume("vol-1").unwrap().state, VolumeState::InUse);
        assert!(host.path_exists(Path::new("/dev/xvdb")).await.unwrap());
        let attachment = cloud.attachment("vol-1").unwrap();
        assert_eq!(attachment.instance_id, "i-local");
        assert!(!attachment.delete_on_termination);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_sets_delete_on_termination() {
        let (cloud, host) = setup();

        VolumeAttacher::attach_volume(&cloud, &host, &context(), &request(true), &timeouts())
            .await
            .unwrap();

        assert!(cloud.attachment("vol-1").unwrap().delete_on_termination);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_on_termination_failure_is_fatal() {
        let (cloud, host) = setup();
        cloud.fail_delete_on_termination(true);

        let result =
            VolumeAttacher::attach_volume(&cloud, &host, &context(), &request(true), &timeouts())
                .await;
        assert_matches!(result, Err(Error::Attach { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_attach_fails() {
        let (cloud, host) = setup();
        cloud.contend_volume("vol-1");

        let result =
            VolumeAttacher::attach_volume(&cloud, &host, &context(), &request(false), &timeouts())
                .await;
        assert_matches!(result, Err(Error::Attach { volume_id, .. }) if volume_id == "vol-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_device_node_times_out() {
        let (cloud, host) = setup();
        cloud.suppress_device_nodes();
        let started = tokio::time::Instant::now();

        let result =
            VolumeAttacher::attach_volume(&cloud, &host, &context(), &request(false), &timeouts())
                .await;

        assert_matches!(result, Err(Error::DeviceNotFound { waited, .. }) if waited == Duration::from_secs(60));
        assert!(started.elapsed() >= Duration::from_secs(60));
    }
}
