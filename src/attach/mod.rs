//! Attach and detach protocol against the block-storage control plane.
//!
//! Attaching a volume is a multi-step exchange with an eventually
//! consistent API:
//!
//! 1. wait for the volume to report `available`, so a detach still in
//!    flight elsewhere can settle;
//! 2. scan the reserved device letters (`/dev/sd[f-p]`), skipping any whose
//!    local node exists under either naming scheme, and request the attach
//!    on the first free one; a provider "device in use" rejection moves the
//!    scan on to the next letter;
//! 3. wait for the attachment to report `attached`;
//! 4. locate the device node, falling back to the `xvd` alias that newer
//!    kernels expose, and detach again if neither appears.

mod wait;

use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::BlockStorage;
use crate::error::VolumeError;
use crate::identity::InstanceIdentity;

pub use wait::BackoffPolicy;

/// Reserved device letters, in scan order.
pub const DEVICE_LETTERS: [char; 11] = ['f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p'];

/// Candidate device considered during one attach attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceSlot {
    letter: char,
}

impl DeviceSlot {
    /// Iterates the reserved slots in scan order.
    #[must_use]
    pub fn all() -> impl Iterator<Item = Self> {
        DEVICE_LETTERS.into_iter().map(|letter| Self { letter })
    }

    /// Device letter of this slot.
    #[must_use]
    pub const fn letter(self) -> char {
        self.letter
    }

    /// Device name sent to the control plane (`/dev/sdX`).
    #[must_use]
    pub fn request_name(self) -> String {
        format!("/dev/sd{}", self.letter)
    }

    /// Node name under the primary scheme (`sdX`).
    #[must_use]
    pub fn primary_node(self) -> String {
        format!("sd{}", self.letter)
    }

    /// Node name under the kernel-remapped scheme (`xvdX`).
    #[must_use]
    pub fn alias_node(self) -> String {
        format!("xvd{}", self.letter)
    }
}

const FIRST_SLOT: DeviceSlot = DeviceSlot { letter: 'f' };
const LAST_SLOT: DeviceSlot = DeviceSlot { letter: 'p' };

/// Local device node lookups rooted at `/dev` (or a test directory).
#[derive(Clone, Debug)]
struct DeviceNodes {
    root: Utf8PathBuf,
}

impl DeviceNodes {
    /// Only a missing node counts as absent; any other probe failure is
    /// surfaced so an unreadable root never makes every slot look free.
    fn exists(&self, node: &str) -> Result<bool, VolumeError> {
        let dir = Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| VolumeError::filesystem(&self.root, &err))?;
        match dir.symlink_metadata(node) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(VolumeError::filesystem(self.path(node), &err)),
        }
    }

    fn occupied(&self, slot: DeviceSlot) -> Result<bool, VolumeError> {
        Ok(self.exists(&slot.primary_node())? || self.exists(&slot.alias_node())?)
    }

    fn path(&self, node: &str) -> Utf8PathBuf {
        self.root.join(node)
    }
}

/// Owns device-slot selection and the attach/detach exchange for one host.
#[derive(Debug)]
pub struct AttachCoordinator<S> {
    storage: Arc<S>,
    instance_id: String,
    devices: DeviceNodes,
    backoff: BackoffPolicy,
    scan_lock: Mutex<()>,
}

impl<S: BlockStorage> AttachCoordinator<S> {
    /// Creates a coordinator attaching volumes to `identity`'s instance and
    /// probing device nodes under `device_root`.
    #[must_use]
    pub fn new(
        storage: Arc<S>,
        identity: &InstanceIdentity,
        device_root: &Utf8Path,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            storage,
            instance_id: identity.instance_id.clone(),
            devices: DeviceNodes {
                root: device_root.to_owned(),
            },
            backoff,
            scan_lock: Mutex::new(()),
        }
    }

    /// Attaches `volume_id` to this host and returns the local device path.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::RemoteState`] when the control plane fails or a
    /// state transition exceeds the polling ceiling,
    /// [`VolumeError::NoFreeDevice`] when every reserved slot is taken, and
    /// [`VolumeError::MissingDevice`] when no device node appears after the
    /// provider confirms the attachment.
    pub async fn attach(&self, volume_id: &str) -> Result<Utf8PathBuf, VolumeError> {
        self.wait_until_available(volume_id).await?;
        let slot = self.request_slot(volume_id).await?;
        self.wait_until_attached(volume_id).await?;

        info!(
            volume_id,
            instance_id = %self.instance_id,
            device = %slot.request_name(),
            "attached volume"
        );
        self.resolve_device(volume_id, slot).await
    }

    /// Requests detachment of `volume_id` without waiting for it to settle.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::RemoteState`] when the control plane rejects
    /// the request.
    pub async fn detach(&self, volume_id: &str) -> Result<(), VolumeError> {
        self.storage
            .detach_volume(volume_id, &self.instance_id)
            .await
            .map_err(|err| VolumeError::remote(volume_id, &err))?;
        info!(volume_id, instance_id = %self.instance_id, "detached volume");
        Ok(())
    }

    async fn request_slot(&self, volume_id: &str) -> Result<DeviceSlot, VolumeError> {
        let _scan = self.scan_lock.lock().await;
        for slot in DeviceSlot::all() {
            if self.devices.occupied(slot)? {
                continue;
            }

            let device = slot.request_name();
            match self
                .storage
                .attach_volume(volume_id, &self.instance_id, &device)
                .await
            {
                Ok(()) => return Ok(slot),
                Err(err) if err.is_device_in_use() => {
                    debug!(volume_id, device = %device, "device rejected as in use, trying next");
                }
                Err(err) => return Err(VolumeError::remote(volume_id, &err)),
            }
        }

        Err(VolumeError::NoFreeDevice {
            first: FIRST_SLOT.request_name(),
            last: LAST_SLOT.request_name(),
        })
    }

    async fn resolve_device(
        &self,
        volume_id: &str,
        slot: DeviceSlot,
    ) -> Result<Utf8PathBuf, VolumeError> {
        let err = match self.locate_node(volume_id, slot) {
            Ok(Some(path)) => return Ok(path),
            Ok(None) => {
                warn!(
                    volume_id,
                    device = %slot.request_name(),
                    "device node missing after attach, detaching"
                );
                VolumeError::MissingDevice {
                    device: self.devices.path(&slot.primary_node()).into_string(),
                }
            }
            Err(err) => {
                warn!(volume_id, error = %err, "cannot probe device node, detaching");
                err
            }
        };

        if let Err(detach_err) = self.detach(volume_id).await {
            warn!(volume_id, error = %detach_err, "rollback detach failed");
        }
        Err(err)
    }

    fn locate_node(
        &self,
        volume_id: &str,
        slot: DeviceSlot,
    ) -> Result<Option<Utf8PathBuf>, VolumeError> {
        let primary = slot.primary_node();
        if self.devices.exists(&primary)? {
            return Ok(Some(self.devices.path(&primary)));
        }

        let alias = slot.alias_node();
        if self.devices.exists(&alias)? {
            let path = self.devices.path(&alias);
            info!(volume_id, device = %path, "local device uses the xvd alias");
            return Ok(Some(path));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests;
