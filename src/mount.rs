//! Local mountpoint management layered on the attach coordinator.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::{info, warn};
use uuid::Uuid;

use crate::attach::AttachCoordinator;
use crate::backend::BlockStorage;
use crate::command::{CommandOutput, CommandRunner, run_blocking};
use crate::error::VolumeError;

const MOUNT_BIN: &str = "mount";
const UMOUNT_BIN: &str = "umount";

/// Creates mountpoints, attaches devices, and runs `mount`/`umount`.
#[derive(Debug)]
pub struct MountManager<S, R> {
    coordinator: AttachCoordinator<S>,
    runner: R,
    mount_root: Utf8PathBuf,
    filesystem: String,
}

impl<S: BlockStorage, R: CommandRunner> MountManager<S, R> {
    /// Creates a manager that places mountpoints under `mount_root` and
    /// mounts devices as `filesystem`.
    #[must_use]
    pub fn new(
        coordinator: AttachCoordinator<S>,
        runner: R,
        mount_root: impl Into<Utf8PathBuf>,
        filesystem: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            runner,
            mount_root: mount_root.into(),
            filesystem: filesystem.into(),
        }
    }

    /// Root directory under which mountpoints are generated.
    #[must_use]
    pub fn mount_root(&self) -> &Utf8Path {
        &self.mount_root
    }

    /// Attaches `volume_id` and mounts it on a freshly generated directory.
    ///
    /// The directory is created before any remote call. When the attach
    /// fails the empty directory is removed again; when the local mount
    /// fails the volume is detached and the directory removed, both on a
    /// best-effort basis.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Filesystem`] when the directory cannot be
    /// created, any attach error from [`AttachCoordinator::attach`], and
    /// [`VolumeError::MountOperation`] when `mount` fails.
    pub async fn mount(&self, volume_id: &str) -> Result<Utf8PathBuf, VolumeError> {
        let mountpoint = self.create_mountpoint()?;

        let device = match self.coordinator.attach(volume_id).await {
            Ok(device) => device,
            Err(err) => {
                self.discard_mountpoint(&mountpoint);
                return Err(err);
            }
        };

        let args = [
            OsString::from("-t"),
            OsString::from(&self.filesystem),
            OsString::from(device.as_str()),
            OsString::from(mountpoint.as_str()),
        ];
        if let Err(err) = self.run(MOUNT_BIN, &args).await {
            warn!(volume_id, device = %device, error = %err, "mount failed, detaching");
            if let Err(detach_err) = self.coordinator.detach(volume_id).await {
                warn!(volume_id, error = %detach_err, "rollback detach failed");
            }
            self.discard_mountpoint(&mountpoint);
            return Err(err);
        }

        info!(volume_id, device = %device, mountpoint = %mountpoint, "mounted volume");
        Ok(mountpoint)
    }

    /// Unmounts `mountpoint`, removes it, and detaches `volume_id`.
    ///
    /// Each step runs only when the previous one succeeded; nothing is
    /// rolled back.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::MountOperation`] when `umount` fails,
    /// [`VolumeError::Filesystem`] when the directory cannot be removed, and
    /// [`VolumeError::RemoteState`] when the detach request fails.
    pub async fn unmount(&self, mountpoint: &Utf8Path, volume_id: &str) -> Result<(), VolumeError> {
        self.run(UMOUNT_BIN, &[OsString::from(mountpoint.as_str())])
            .await?;
        remove_mountpoint(mountpoint)?;
        self.coordinator.detach(volume_id).await?;
        info!(volume_id, mountpoint = %mountpoint, "unmounted volume");
        Ok(())
    }

    fn create_mountpoint(&self) -> Result<Utf8PathBuf, VolumeError> {
        let name = Uuid::new_v4().simple().to_string();
        let mountpoint = self.mount_root.join(&name);

        Dir::create_ambient_dir_all(&mountpoint, ambient_authority())
            .map_err(|err| VolumeError::filesystem(&mountpoint, &err))?;
        let is_dir = Dir::open_ambient_dir(&self.mount_root, ambient_authority())
            .and_then(|root| root.metadata(&name))
            .map_err(|err| VolumeError::filesystem(&mountpoint, &err))?
            .is_dir();
        if !is_dir {
            return Err(VolumeError::Filesystem {
                path: mountpoint,
                message: String::from("not a directory"),
            });
        }
        Ok(mountpoint)
    }

    fn discard_mountpoint(&self, mountpoint: &Utf8Path) {
        if let Err(err) = remove_mountpoint(mountpoint) {
            warn!(
                mountpoint = %mountpoint,
                root = %self.mount_root,
                error = %err,
                "leaving mountpoint behind"
            );
        }
    }

    async fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, VolumeError> {
        let output = run_blocking(&self.runner, program, args)
            .await
            .map_err(|err| VolumeError::MountOperation {
                message: err.to_string(),
            })?;
        if output.is_success() {
            return Ok(output);
        }

        let rendered = args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let detail = output.combined();
        let message = if detail.is_empty() {
            format!("{program} {rendered} exited with status {}", output.status_text())
        } else {
            format!(
                "{program} {rendered} exited with status {}: {detail}",
                output.status_text()
            )
        };
        Err(VolumeError::MountOperation { message })
    }
}

fn remove_mountpoint(mountpoint: &Utf8Path) -> Result<(), VolumeError> {
    let (Some(parent), Some(name)) = (mountpoint.parent(), mountpoint.file_name()) else {
        return Err(VolumeError::Filesystem {
            path: mountpoint.to_owned(),
            message: String::from("mountpoint has no parent directory"),
        });
    };
    Dir::open_ambient_dir(parent, ambient_authority())
        .and_then(|dir| dir.remove_dir(name))
        .map_err(|err| VolumeError::filesystem(mountpoint, &err))
}
