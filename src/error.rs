//! Error taxonomy for the volume lifecycle engine.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::backend::CloudError;

/// Errors raised by volume lifecycle operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VolumeError {
    /// Raised when the volume name has never been created or was removed.
    #[error("volume {name} not found")]
    NotFound {
        /// Volume name supplied by the caller.
        name: String,
    },
    /// Raised when the name is registered in a state incompatible with the request.
    #[error("volume {name} is in use: {reason}")]
    Conflict {
        /// Volume name supplied by the caller.
        name: String,
        /// Why the request conflicts with the current state.
        reason: String,
    },
    /// Raised when a mountpoint is requested for an unmounted volume.
    #[error("volume {name} is not mounted")]
    NotMounted {
        /// Volume name supplied by the caller.
        name: String,
    },
    /// Raised when no available volume carries the requested service tag.
    #[error("no volume available for service {service} in zone {zone}")]
    NoServiceVolume {
        /// Service tag requested by the caller.
        service: String,
        /// Availability zone that was searched.
        zone: String,
    },
    /// Raised when the control plane fails or a state transition never settles.
    #[error("cloud volume {volume_id}: {message}")]
    RemoteState {
        /// Backing cloud volume identifier.
        volume_id: String,
        /// Provider failure or the last observed state.
        message: String,
    },
    /// Raised when the search for a service-tagged volume fails.
    #[error("volume search for service {service} failed: {message}")]
    ServiceSearch {
        /// Service tag that was searched for.
        service: String,
        /// Provider failure.
        message: String,
    },
    /// Raised when the task driving an operation ended before completing.
    #[error("operation on volume {name} did not complete: {message}")]
    Interrupted {
        /// Volume name supplied by the caller.
        name: String,
        /// Why the task ended.
        message: String,
    },
    /// Raised when every reserved device slot is occupied.
    #[error("no devices available for attach: {first}..{last} taken")]
    NoFreeDevice {
        /// First device in the reserved range.
        first: String,
        /// Last device in the reserved range.
        last: String,
    },
    /// Raised when the device node is absent after the provider reports attachment.
    #[error("device {device} is missing after attach")]
    MissingDevice {
        /// Device path that was expected to appear.
        device: String,
    },
    /// Raised when the local `mount` or `umount` invocation fails.
    #[error("{message}")]
    MountOperation {
        /// Description including the command output.
        message: String,
    },
    /// Raised when a mountpoint directory cannot be created or removed.
    #[error("mountpoint {path}: {message}")]
    Filesystem {
        /// Directory being manipulated.
        path: Utf8PathBuf,
        /// Error reported by the filesystem.
        message: String,
    },
}

impl VolumeError {
    /// Wraps a control plane failure for `volume_id`.
    #[must_use]
    pub fn remote(volume_id: &str, err: &CloudError) -> Self {
        Self::RemoteState {
            volume_id: volume_id.to_owned(),
            message: err.to_string(),
        }
    }

    pub(crate) fn filesystem(path: impl Into<Utf8PathBuf>, err: &std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
