//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::attach::BackoffPolicy;
use crate::identity::InstanceIdentity;

/// Default Unix socket the plugin protocol is served on.
pub const DEFAULT_SOCKET_PATH: &str = "/run/docker/plugins/blocker.sock";

/// Default root under which mountpoints are generated.
pub const DEFAULT_MOUNT_ROOT: &str = "/mnt/blocker";

/// Default instance metadata endpoint.
pub const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254";

/// Daemon configuration derived from defaults, configuration files, and
/// `BLOCKER_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BLOCKER",
    discovery(
        app_name = "blocker",
        env_var = "BLOCKER_CONFIG_PATH",
        config_file_name = "blocker.toml",
        dotfile_name = ".blocker.toml",
        project_file_name = "blocker.toml"
    )
)]
pub struct BlockerConfig {
    /// Unix socket the plugin adapter listens on.
    #[ortho_config(default = DEFAULT_SOCKET_PATH.to_owned())]
    pub socket_path: String,
    /// Directory under which per-mount directories are created.
    #[ortho_config(default = DEFAULT_MOUNT_ROOT.to_owned())]
    pub mount_root: String,
    /// Directory probed for local block device nodes.
    #[ortho_config(default = "/dev".to_owned())]
    pub device_root: String,
    /// Filesystem type passed to `mount -t`. Volumes are never formatted.
    #[ortho_config(default = "ext4".to_owned())]
    pub filesystem: String,
    /// Path to the `aws` CLI used for the EC2 control plane.
    #[ortho_config(default = crate::aws::DEFAULT_AWS_BIN.to_owned())]
    pub aws_bin: String,
    /// Base URL of the instance metadata service.
    #[ortho_config(default = DEFAULT_METADATA_ENDPOINT.to_owned())]
    pub metadata_endpoint: String,
    /// Number of state checks before an attach or detach wait gives up.
    #[ortho_config(default = 12)]
    pub poll_attempts: u32,
    /// Seconds between state checks.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Tag key matched against the `service` create option.
    #[ortho_config(default = crate::lookup::DEFAULT_SERVICE_TAG_KEY.to_owned())]
    pub service_tag_key: String,
    /// Fallback tracing filter when `RUST_LOG` is unset.
    #[ortho_config(default = "info".to_owned())]
    pub log_level: String,
    /// Static instance id; with `region` and `availability_zone` it replaces
    /// metadata discovery.
    pub instance_id: Option<String>,
    /// Static region for the identity override.
    pub region: Option<String>,
    /// Static availability zone for the identity override.
    pub availability_zone: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

const REQUIRED_FIELDS: [FieldMetadata; 8] = [
    FieldMetadata::new("plugin socket path", "BLOCKER_SOCKET_PATH", "socket_path"),
    FieldMetadata::new("mount root directory", "BLOCKER_MOUNT_ROOT", "mount_root"),
    FieldMetadata::new("device root directory", "BLOCKER_DEVICE_ROOT", "device_root"),
    FieldMetadata::new("filesystem type", "BLOCKER_FILESYSTEM", "filesystem"),
    FieldMetadata::new("AWS CLI binary", "BLOCKER_AWS_BIN", "aws_bin"),
    FieldMetadata::new(
        "instance metadata endpoint",
        "BLOCKER_METADATA_ENDPOINT",
        "metadata_endpoint",
    ),
    FieldMetadata::new("service tag key", "BLOCKER_SERVICE_TAG_KEY", "service_tag_key"),
    FieldMetadata::new("log level", "BLOCKER_LOG_LEVEL", "log_level"),
];

impl BlockerConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to blocker.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    const fn required_values(&self) -> [&String; 8] {
        [
            &self.socket_path,
            &self.mount_root,
            &self.device_root,
            &self.filesystem,
            &self.aws_bin,
            &self.metadata_endpoint,
            &self.service_tag_key,
            &self.log_level,
        ]
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("blocker")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and configuration key that supply the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is blank
    /// and [`ConfigError::Invalid`] when the polling policy or identity
    /// override is inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, metadata) in self.required_values().into_iter().zip(&REQUIRED_FIELDS) {
            Self::require_field(value, metadata)?;
        }
        if self.poll_attempts == 0 {
            return Err(ConfigError::Invalid(String::from(
                "poll_attempts must be greater than zero (BLOCKER_POLL_ATTEMPTS)",
            )));
        }
        let overrides = [&self.instance_id, &self.region, &self.availability_zone]
            .into_iter()
            .filter(|value| value.as_deref().is_some_and(|raw| !raw.trim().is_empty()))
            .count();
        if overrides != 0 && overrides != 3 {
            return Err(ConfigError::Invalid(String::from(
                "instance_id, region, and availability_zone must be set together \
                 (BLOCKER_INSTANCE_ID, BLOCKER_REGION, BLOCKER_AVAILABILITY_ZONE)",
            )));
        }
        Ok(())
    }

    /// Polling policy for asynchronous volume state transitions.
    #[must_use]
    pub const fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.poll_attempts,
            Duration::from_secs(self.poll_interval_secs),
        )
    }

    /// Identity supplied through configuration, when fully specified.
    #[must_use]
    pub fn static_identity(&self) -> Option<InstanceIdentity> {
        match (&self.instance_id, &self.region, &self.availability_zone) {
            (Some(instance_id), Some(region), Some(zone))
                if [instance_id, region, zone]
                    .iter()
                    .all(|value| !value.trim().is_empty()) =>
            {
                Some(InstanceIdentity::new(
                    instance_id.as_str(),
                    region.as_str(),
                    zone.as_str(),
                ))
            }
            _ => None,
        }
    }

    /// Socket path as a UTF-8 path.
    #[must_use]
    pub fn socket_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.socket_path)
    }

    /// Mount root as a UTF-8 path.
    #[must_use]
    pub fn mount_root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.mount_root)
    }

    /// Device root as a UTF-8 path.
    #[must_use]
    pub fn device_root(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.device_root)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates values that are present but unusable together.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
