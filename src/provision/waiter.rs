//! Availability Waiter
//!
//! Deadline-bounded polling of control-plane state, and the generic poll
//! loop every blocking wait in the provisioner is built on.

use crate::domain::ports::{ControlPlane, VolumeFilter, VolumeState};
use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Re-run `check` every `interval` until it reports `true` or `timeout`
/// has elapsed on the monotonic clock.
///
/// Returns `Ok(false)` when the deadline passes; errors from `check` end
/// the wait immediately. `check` always runs at least once.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(true);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        sleep(interval.min(deadline - now)).await;
    }
}

/// Waits for volumes to reach a state
pub struct AvailabilityWaiter;

impl AvailabilityWaiter {
    /// Block until `volume_id` is `available`
    pub async fn wait_until_volume_available(
        control_plane: &dyn ControlPlane,
        volume_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        Self::wait_for_state(control_plane, volume_id, VolumeState::Available, timeout, interval)
            .await
    }

    /// Block until `volume_id` reports `wanted`
    ///
    /// Fails with `VolumeTimeout` at the deadline and with `VolumeFailed`
    /// as soon as the volume lands in a state it cannot leave.
    pub async fn wait_for_state(
        control_plane: &dyn ControlPlane,
        volume_id: &str,
        wanted: VolumeState,
        timeout: Duration,
        interval: Duration,
    ) -> Result<()> {
        let filter = VolumeFilter::by_id(volume_id);

        let reached = poll_until(timeout, interval, || {
            let filter = &filter;
            async move {
                let volumes = control_plane.describe_volumes(filter).await?;
                match volumes.first() {
                    // Adapters report ids the control plane does not know
                    // yet as an empty result
                    None => Ok(false),
                    Some(volume) if volume.state == wanted => Ok(true),
                    Some(volume) if volume.state.is_terminal_failure() => {
                        Err(Error::VolumeFailed {
                            volume_id: volume_id.to_string(),
                            state: volume.state.to_string(),
                            wanted: wanted.to_string(),
                        })
                    }
                    Some(volume) => {
                        debug!("Volume {} is {}, waiting for {}", volume_id, volume.state, wanted);
                        Ok(false)
                    }
                }
            }
        })
        .await?;

        if reached {
            Ok(())
        } else {
            Err(Error::VolumeTimeout {
                volume_id: volume_id.to_string(),
                wanted: wanted.to_string(),
                waited: timeout,
            })
        }
    }
}
