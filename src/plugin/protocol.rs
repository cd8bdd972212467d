//! Wire types of the Docker volume plugin protocol.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::registry::VolumeRecord;

/// Request body shared by the per-volume endpoints.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeRequest {
    /// Volume name.
    pub name: String,
    /// Driver options, sent by `Create` only.
    #[serde(default)]
    pub opts: Option<HashMap<String, String>>,
    /// Caller id, sent by `Mount` and `Unmount`.
    #[serde(default, rename = "ID")]
    pub id: Option<String>,
}

/// Response carrying only an error string.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrResponse {
    /// Empty on success.
    pub err: String,
}

/// Response of `Mount` and `Path`.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountpointResponse {
    /// Mountpoint, empty on failure.
    pub mountpoint: String,
    /// Empty on success.
    pub err: String,
}

/// Volume summary used by `Get` and `List`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeInfo {
    /// Volume name.
    pub name: String,
    /// Mountpoint, omitted while unmounted.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mountpoint: String,
}

impl From<VolumeRecord> for VolumeInfo {
    fn from(record: VolumeRecord) -> Self {
        Self {
            name: record.name,
            mountpoint: record
                .mountpoint
                .map(camino::Utf8PathBuf::into_string)
                .unwrap_or_default(),
        }
    }
}

/// Response of `Get`.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetResponse {
    /// The volume, omitted on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeInfo>,
    /// Empty on success.
    pub err: String,
}

/// Response of `List`.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListResponse {
    /// Registered volumes.
    pub volumes: Vec<VolumeInfo>,
    /// Empty on success.
    pub err: String,
}

/// Response of `Plugin.Activate`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateResponse {
    /// Plugin subsystems implemented.
    pub implements: Vec<&'static str>,
}

/// Response of `VolumeDriver.Capabilities`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    /// Advertised capabilities.
    pub capabilities: Capabilities,
}

/// Capability set of this driver.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Capabilities {
    /// `local`: volumes are visible to this host only.
    pub scope: &'static str,
}
