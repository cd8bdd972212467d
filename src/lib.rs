//! Core library for the `blocker` Docker volume plugin.
//!
//! The crate maps named Docker volumes onto EBS block devices: it resolves
//! the backing cloud volume, attaches it to this instance on a free device
//! slot, mounts it under a generated directory, and reverses the process on
//! unmount. The [`registry::VolumeRegistry`] engine is served to Docker by
//! the [`plugin`] adapter.

pub mod attach;
pub mod aws;
pub mod backend;
pub mod command;
pub mod config;
pub mod error;
pub mod identity;
pub mod lookup;
pub mod mount;
pub mod plugin;
pub mod registry;
pub mod test_support;

pub use attach::{AttachCoordinator, BackoffPolicy, DeviceSlot};
pub use aws::AwsCliBlockStorage;
pub use backend::{BlockStorage, CloudError, VolumeFilter, VolumeSnapshot};
pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{BlockerConfig, ConfigError};
pub use error::VolumeError;
pub use identity::{IdentityError, InstanceIdentity};
pub use lookup::CloudVolumeLookup;
pub use mount::MountManager;
pub use plugin::PluginError;
pub use registry::{CreateOptions, VolumeCatalog, VolumeDriver, VolumeRecord, VolumeRegistry};
