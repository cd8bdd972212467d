//! Bounded polling of asynchronous volume state transitions.

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::backend::{
    ATTACHMENT_STATE_ATTACHED, BlockStorage, VOLUME_STATE_AVAILABLE, VolumeSnapshot,
};
use crate::error::VolumeError;

use super::AttachCoordinator;

const DEFAULT_ATTEMPTS: u32 = 12;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed-attempt, fixed-interval polling policy.
///
/// The state is checked up to `attempts` times with `interval` between
/// checks, so the worst-case wait is `(attempts - 1) * interval` plus the
/// time spent in the checks themselves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BackoffPolicy {
    attempts: u32,
    interval: Duration,
}

impl BackoffPolicy {
    /// Creates a policy; an attempt count of zero is raised to one.
    #[must_use]
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: if attempts == 0 { 1 } else { attempts },
            interval,
        }
    }

    /// Policy that retries without sleeping, for tests.
    #[must_use]
    pub const fn immediate(attempts: u32) -> Self {
        Self::new(attempts, Duration::ZERO)
    }

    /// Maximum number of state checks.
    #[must_use]
    pub const fn attempts(self) -> u32 {
        self.attempts
    }

    /// Sleep between consecutive checks.
    #[must_use]
    pub const fn interval(self) -> Duration {
        self.interval
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS, DEFAULT_INTERVAL)
    }
}

fn require_available(volume: &VolumeSnapshot) -> Result<(), String> {
    if volume.state == VOLUME_STATE_AVAILABLE {
        return Ok(());
    }
    Err(format!(
        "seeking {VOLUME_STATE_AVAILABLE}, current is {}",
        volume.state
    ))
}

fn require_attached(volume: &VolumeSnapshot) -> Result<(), String> {
    match volume.attachments.as_slice() {
        [attachment] if attachment.state == ATTACHMENT_STATE_ATTACHED => Ok(()),
        [attachment] => Err(format!(
            "seeking {ATTACHMENT_STATE_ATTACHED}, current is {}",
            attachment.state
        )),
        others => Err(format!("expected 1 attachment, got {}", others.len())),
    }
}

impl<S: BlockStorage> AttachCoordinator<S> {
    /// Waits for a volume detaching elsewhere to quiesce.
    pub(super) async fn wait_until_available(&self, volume_id: &str) -> Result<(), VolumeError> {
        self.wait_until(volume_id, VOLUME_STATE_AVAILABLE, require_available)
            .await
    }

    pub(super) async fn wait_until_attached(&self, volume_id: &str) -> Result<(), VolumeError> {
        self.wait_until(volume_id, ATTACHMENT_STATE_ATTACHED, require_attached)
            .await
    }

    async fn wait_until(
        &self,
        volume_id: &str,
        target: &str,
        check: fn(&VolumeSnapshot) -> Result<(), String>,
    ) -> Result<(), VolumeError> {
        let attempts = self.backoff.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let volume = self
                .storage
                .describe_volume(volume_id)
                .await
                .map_err(|err| VolumeError::remote(volume_id, &err))?;

            let Err(reason) = check(&volume) else {
                return Ok(());
            };
            if attempt >= attempts {
                return Err(VolumeError::RemoteState {
                    volume_id: volume_id.to_owned(),
                    message: format!(
                        "state transition to {target} did not complete after {attempts} checks: {reason}"
                    ),
                });
            }

            debug!(volume_id, attempt, %reason, "waiting for volume to become {target}");
            sleep(self.backoff.interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AttachmentSnapshot;

    fn with_attachments(states: &[&str]) -> VolumeSnapshot {
        VolumeSnapshot {
            attachments: states
                .iter()
                .map(|state| AttachmentSnapshot {
                    state: (*state).to_owned(),
                    ..AttachmentSnapshot::default()
                })
                .collect(),
            ..VolumeSnapshot::default()
        }
    }

    #[test]
    fn zero_attempts_is_raised_to_one() {
        assert_eq!(BackoffPolicy::immediate(0).attempts(), 1);
    }

    #[test]
    fn default_policy_matches_one_minute_ceiling() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.attempts(), 12);
        assert_eq!(policy.interval(), Duration::from_secs(5));
    }

    #[test]
    fn attached_check_describes_current_state() {
        assert_eq!(require_attached(&with_attachments(&["attached"])), Ok(()));
        assert_eq!(
            require_attached(&with_attachments(&["attaching"])),
            Err(String::from("seeking attached, current is attaching"))
        );
        assert_eq!(
            require_attached(&with_attachments(&[])),
            Err(String::from("expected 1 attachment, got 0"))
        );
    }
}
