//! Named-volume registry and lifecycle state machine.
//!
//! Each volume name moves through
//! `unregistered -> registered -> mounted -> registered -> ... -> removed`.
//! Operations on one name are serialised by a per-name async lock that is
//! held for the whole operation, remote polling included, so concurrent
//! requests for the same name observe each other's outcome. Unrelated names
//! proceed independently.

mod options;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8PathBuf;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::backend::{BackendFuture, BlockStorage};
use crate::command::CommandRunner;
use crate::error::VolumeError;
use crate::lookup::CloudVolumeLookup;
use crate::mount::MountManager;

pub use options::{CreateOptions, SERVICE_OPTION, VOLUME_ID_OPTION};

/// One logical volume known to the registry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeRecord {
    /// Name chosen by the orchestrator.
    pub name: String,
    /// Backing cloud volume id.
    pub volume_id: String,
    /// Local mountpoint while the volume is mounted.
    pub mountpoint: Option<Utf8PathBuf>,
}

/// The five volume operations the orchestrator drives.
pub trait VolumeDriver: Send + Sync {
    /// Registers `name`, or updates its backing id while unmounted.
    fn create<'a>(
        &'a self,
        name: &'a str,
        options: CreateOptions,
    ) -> BackendFuture<'a, (), VolumeError>;

    /// Attaches and mounts `name`, returning its mountpoint.
    fn mount<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Utf8PathBuf, VolumeError>;

    /// Returns the mountpoint of a mounted `name`.
    fn path<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Utf8PathBuf, VolumeError>;

    /// Unmounts and detaches `name`; succeeds when it is not mounted.
    fn unmount<'a>(&'a self, name: &'a str) -> BackendFuture<'a, (), VolumeError>;

    /// Unmounts `name` if needed, then forgets it.
    fn remove<'a>(&'a self, name: &'a str) -> BackendFuture<'a, (), VolumeError>;
}

/// Read-only enumeration of registered volumes.
pub trait VolumeCatalog: Send + Sync {
    /// Returns every registered volume, sorted by name.
    fn list(&self) -> BackendFuture<'_, Vec<VolumeRecord>, VolumeError>;

    /// Returns the record for `name`.
    fn get<'a>(&'a self, name: &'a str) -> BackendFuture<'a, VolumeRecord, VolumeError>;
}

#[derive(Debug, Default)]
enum Slot {
    /// Reserved by an in-flight `Create` that has not committed.
    #[default]
    Vacant,
    Live(VolumeRecord),
    /// Removed while a waiter held a handle; the waiter must start over.
    Retired,
}

type SlotHandle = Arc<AsyncMutex<Slot>>;
type SlotGuard = OwnedMutexGuard<Slot>;

/// Registry of named volumes backed by cloud block storage.
#[derive(Debug)]
pub struct VolumeRegistry<S, R> {
    mounts: MountManager<S, R>,
    lookup: CloudVolumeLookup<S>,
    slots: Mutex<HashMap<String, SlotHandle>>,
}

impl<S: BlockStorage, R: CommandRunner> VolumeRegistry<S, R> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(mounts: MountManager<S, R>, lookup: CloudVolumeLookup<S>) -> Self {
        Self {
            mounts,
            lookup,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, SlotHandle>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the slot for `name`, inserting a vacant one when absent.
    async fn lock_or_reserve(&self, name: &str) -> SlotGuard {
        loop {
            let handle = Arc::clone(self.slots().entry(name.to_owned()).or_default());
            let guard = handle.lock_owned().await;
            if !matches!(*guard, Slot::Retired) {
                return guard;
            }
        }
    }

    /// Locks the slot for a registered `name`.
    async fn lock_live(&self, name: &str) -> Result<SlotGuard, VolumeError> {
        loop {
            let handle = self
                .slots()
                .get(name)
                .cloned()
                .ok_or_else(|| not_found(name))?;
            let guard = handle.lock_owned().await;
            match *guard {
                Slot::Live(_) => return Ok(guard),
                Slot::Vacant => return Err(not_found(name)),
                Slot::Retired => {}
            }
        }
    }

    /// Marks the slot retired and drops it from the map.
    fn retire(&self, name: &str, mut guard: SlotGuard) {
        *guard = Slot::Retired;
        let mut slots = self.slots();
        let stale = slots
            .get(name)
            .is_some_and(|handle| Arc::ptr_eq(handle, OwnedMutexGuard::mutex(&guard)));
        if stale {
            slots.remove(name);
        }
    }

    async fn create_volume(&self, name: &str, options: CreateOptions) -> Result<(), VolumeError> {
        let mut guard = self.lock_or_reserve(name).await;
        if let Slot::Live(record) = &mut *guard {
            if let Some(mountpoint) = &record.mountpoint {
                return Err(VolumeError::Conflict {
                    name: name.to_owned(),
                    reason: format!("mounted at {mountpoint}"),
                });
            }
            if let Some(volume_id) = options.volume_id {
                debug!(volume = name, volume_id = %volume_id, "updating backing volume");
                record.volume_id = volume_id;
            }
            info!(volume = name, volume_id = %record.volume_id, "volume re-created");
            return Ok(());
        }

        let volume_id = match self.resolve_backing(name, options).await {
            Ok(volume_id) => volume_id,
            Err(err) => {
                self.retire(name, guard);
                return Err(err);
            }
        };
        info!(volume = name, volume_id = %volume_id, "volume created");
        *guard = Slot::Live(VolumeRecord {
            name: name.to_owned(),
            volume_id,
            mountpoint: None,
        });
        Ok(())
    }

    async fn resolve_backing(
        &self,
        name: &str,
        options: CreateOptions,
    ) -> Result<String, VolumeError> {
        let mut volume_id = name.to_owned();
        if let Some(service) = options.service {
            volume_id = self.lookup.find_by_service_tag(&service).await?;
        }
        if let Some(explicit) = options.volume_id {
            volume_id = explicit;
        }
        Ok(volume_id)
    }

    async fn mount_volume(&self, name: &str) -> Result<Utf8PathBuf, VolumeError> {
        let mut guard = self.lock_live(name).await?;
        let record = live_record(&mut guard, name)?;
        if let Some(mountpoint) = &record.mountpoint {
            return Err(VolumeError::Conflict {
                name: name.to_owned(),
                reason: format!("already mounted at {mountpoint}"),
            });
        }

        let mountpoint = self.mounts.mount(&record.volume_id).await?;
        record.mountpoint = Some(mountpoint.clone());
        info!(volume = name, mountpoint = %mountpoint, "volume mounted");
        Ok(mountpoint)
    }

    async fn volume_path(&self, name: &str) -> Result<Utf8PathBuf, VolumeError> {
        let mut guard = self.lock_live(name).await?;
        live_record(&mut guard, name)?
            .mountpoint
            .clone()
            .ok_or_else(|| VolumeError::NotMounted {
                name: name.to_owned(),
            })
    }

    async fn unmount_volume(&self, name: &str) -> Result<(), VolumeError> {
        let mut guard = self.lock_live(name).await?;
        self.unmount_record(live_record(&mut guard, name)?).await
    }

    /// Clears the mountpoint only once unmount, removal, and detach all succeed.
    async fn unmount_record(&self, record: &mut VolumeRecord) -> Result<(), VolumeError> {
        let Some(mountpoint) = record.mountpoint.clone() else {
            debug!(volume = %record.name, "volume not mounted, nothing to unmount");
            return Ok(());
        };

        if let Err(err) = self.mounts.unmount(&mountpoint, &record.volume_id).await {
            warn!(
                volume = %record.name,
                mountpoint = %mountpoint,
                error = %err,
                "unmount failed, keeping mountpoint"
            );
            return Err(err);
        }
        record.mountpoint = None;
        info!(volume = %record.name, "volume unmounted");
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), VolumeError> {
        let mut guard = self.lock_live(name).await?;
        self.unmount_record(live_record(&mut guard, name)?).await?;
        self.retire(name, guard);
        info!(volume = name, "volume removed");
        Ok(())
    }

    async fn records(&self) -> Vec<VolumeRecord> {
        let handles = self.slots().values().cloned().collect::<Vec<_>>();
        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Slot::Live(record) = &*handle.lock().await {
                records.push(record.clone());
            }
        }
        records.sort_by(|left, right| left.name.cmp(&right.name));
        records
    }
}

fn not_found(name: &str) -> VolumeError {
    VolumeError::NotFound {
        name: name.to_owned(),
    }
}

fn live_record<'g>(
    guard: &'g mut SlotGuard,
    name: &str,
) -> Result<&'g mut VolumeRecord, VolumeError> {
    match &mut **guard {
        Slot::Live(record) => Ok(record),
        Slot::Vacant | Slot::Retired => Err(not_found(name)),
    }
}

impl<S: BlockStorage, R: CommandRunner> VolumeDriver for VolumeRegistry<S, R> {
    fn create<'a>(
        &'a self,
        name: &'a str,
        options: CreateOptions,
    ) -> BackendFuture<'a, (), VolumeError> {
        Box::pin(self.create_volume(name, options))
    }

    fn mount<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Utf8PathBuf, VolumeError> {
        Box::pin(self.mount_volume(name))
    }

    fn path<'a>(&'a self, name: &'a str) -> BackendFuture<'a, Utf8PathBuf, VolumeError> {
        Box::pin(self.volume_path(name))
    }

    fn unmount<'a>(&'a self, name: &'a str) -> BackendFuture<'a, (), VolumeError> {
        Box::pin(self.unmount_volume(name))
    }

    fn remove<'a>(&'a self, name: &'a str) -> BackendFuture<'a, (), VolumeError> {
        Box::pin(self.remove_volume(name))
    }
}

impl<S: BlockStorage, R: CommandRunner> VolumeCatalog for VolumeRegistry<S, R> {
    fn list(&self) -> BackendFuture<'_, Vec<VolumeRecord>, VolumeError> {
        Box::pin(async move { Ok(self.records().await) })
    }

    fn get<'a>(&'a self, name: &'a str) -> BackendFuture<'a, VolumeRecord, VolumeError> {
        Box::pin(async move {
            let guard = self.lock_live(name).await?;
            match &*guard {
                Slot::Live(record) => Ok(record.clone()),
                Slot::Vacant | Slot::Retired => Err(not_found(name)),
            }
        })
    }
}
