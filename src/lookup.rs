//! Resolution of service tags to concrete cloud volumes.

use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{BlockStorage, VOLUME_STATE_AVAILABLE, VolumeFilter};
use crate::error::VolumeError;
use crate::identity::InstanceIdentity;

/// Default tag key identifying the service a volume belongs to.
pub const DEFAULT_SERVICE_TAG_KEY: &str = "service";

/// Picks an available volume in this host's zone by service tag.
#[derive(Debug)]
pub struct CloudVolumeLookup<S> {
    storage: Arc<S>,
    availability_zone: String,
    tag_key: String,
}

impl<S: BlockStorage> CloudVolumeLookup<S> {
    /// Creates a lookup scoped to `identity`'s availability zone.
    #[must_use]
    pub fn new(storage: Arc<S>, identity: &InstanceIdentity, tag_key: impl Into<String>) -> Self {
        Self {
            storage,
            availability_zone: identity.availability_zone.clone(),
            tag_key: tag_key.into(),
        }
    }

    /// Returns the id of the first available volume tagged with `service`.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::ServiceSearch`] when the search fails and
    /// [`VolumeError::NoServiceVolume`] when nothing matches.
    pub async fn find_by_service_tag(&self, service: &str) -> Result<String, VolumeError> {
        let filter = VolumeFilter {
            status: String::from(VOLUME_STATE_AVAILABLE),
            availability_zone: self.availability_zone.clone(),
            tag_key: self.tag_key.clone(),
            tag_value: service.to_owned(),
        };

        let candidates = self
            .storage
            .find_volumes(&filter)
            .await
            .map_err(|err| VolumeError::ServiceSearch {
                service: service.to_owned(),
                message: err.to_string(),
            })?;
        debug!(service, candidates = candidates.len(), "service volume search");

        let volume = candidates
            .into_iter()
            .next()
            .ok_or_else(|| VolumeError::NoServiceVolume {
                service: service.to_owned(),
                zone: self.availability_zone.clone(),
            })?;
        info!(service, volume_id = %volume.id, "resolved service volume");
        Ok(volume.id)
    }
}
