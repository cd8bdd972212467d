//! Cloud block-storage control plane abstraction.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Provider status of a volume that can be attached.
pub const VOLUME_STATE_AVAILABLE: &str = "available";

/// Provider status of an attachment that is complete.
pub const ATTACHMENT_STATE_ATTACHED: &str = "attached";

/// Provider error code returned when the requested device name is taken.
pub const DEVICE_IN_USE_CODE: &str = "InvalidParameterValue";

/// Provider error code returned when a volume id does not exist.
pub const VOLUME_NOT_FOUND_CODE: &str = "InvalidVolume.NotFound";

/// Point-in-time view of a cloud volume.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeSnapshot {
    /// Provider volume identifier.
    pub id: String,
    /// Provider status (for example `available` or `in-use`).
    pub state: String,
    /// Availability zone hosting the volume.
    pub availability_zone: String,
    /// Current attachments, usually zero or one.
    pub attachments: Vec<AttachmentSnapshot>,
    /// Key/value tags assigned to the volume.
    pub tags: Vec<(String, String)>,
}

impl VolumeSnapshot {
    /// Returns the value of tag `key`, if present.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(tag_key, _)| tag_key == key)
            .map(|(_, value)| value.as_str())
    }
}

/// Point-in-time view of one attachment of a volume.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttachmentSnapshot {
    /// Instance the volume is attached to.
    pub instance_id: String,
    /// Device name requested for the attachment.
    pub device: String,
    /// Attachment state (for example `attaching` or `attached`).
    pub state: String,
}

/// Criteria used to search for candidate volumes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeFilter {
    /// Required volume status.
    pub status: String,
    /// Required availability zone.
    pub availability_zone: String,
    /// Tag key that must be present.
    pub tag_key: String,
    /// Value the tag must carry.
    pub tag_value: String,
}

impl VolumeFilter {
    /// Returns `true` when `volume` satisfies every criterion.
    #[must_use]
    pub fn matches(&self, volume: &VolumeSnapshot) -> bool {
        volume.state == self.status
            && volume.availability_zone == self.availability_zone
            && volume.tag(&self.tag_key) == Some(self.tag_value.as_str())
    }
}

/// Failure reported by the control plane.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{operation} failed{}: {message}", code_suffix(.code.as_deref()))]
pub struct CloudError {
    /// Provider operation that failed (for example `AttachVolume`).
    pub operation: String,
    /// Provider error code, when one could be extracted.
    pub code: Option<String>,
    /// Human readable message.
    pub message: String,
}

impl CloudError {
    /// Builds an error for `operation` without a provider code.
    #[must_use]
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            code: None,
            message: message.into(),
        }
    }

    /// Attaches a provider error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Returns `true` when the provider rejected a device name as in use.
    #[must_use]
    pub fn is_device_in_use(&self) -> bool {
        self.code.as_deref() == Some(DEVICE_IN_USE_CODE)
    }
}

fn code_suffix(code: Option<&str>) -> String {
    code.map(|value| format!(" ({value})")).unwrap_or_default()
}

/// Future returned by control plane operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Operations the engine needs from the cloud block-storage API.
pub trait BlockStorage: Send + Sync {
    /// Fetches the current state of one volume.
    fn describe_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> BackendFuture<'a, VolumeSnapshot, CloudError>;

    /// Lists volumes matching `filter`, in the provider's order.
    fn find_volumes<'a>(
        &'a self,
        filter: &'a VolumeFilter,
    ) -> BackendFuture<'a, Vec<VolumeSnapshot>, CloudError>;

    /// Requests attachment of `volume_id` to `instance_id` as `device`.
    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> BackendFuture<'a, (), CloudError>;

    /// Requests detachment of `volume_id` from `instance_id`.
    fn detach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
    ) -> BackendFuture<'a, (), CloudError>;
}
