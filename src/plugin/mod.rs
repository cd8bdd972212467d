//! Docker volume plugin adapter served over a Unix socket.
//!
//! Every endpoint is a `POST` carrying JSON. Failures travel in the `Err`
//! field of an HTTP 200 response, as the plugin protocol expects.

mod protocol;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::Json;
use axum::routing::post;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::error::VolumeError;
use crate::registry::{CreateOptions, VolumeCatalog, VolumeDriver};

pub use protocol::{
    ActivateResponse, Capabilities, CapabilitiesResponse, ErrResponse, GetResponse, ListResponse,
    MountpointResponse, VolumeInfo, VolumeRequest,
};

/// Engine surface served by the adapter.
pub trait PluginEngine: VolumeDriver + VolumeCatalog {}

impl<T: VolumeDriver + VolumeCatalog> PluginEngine for T {}

/// Shared handle to the engine behind the adapter.
pub type SharedEngine = Arc<dyn PluginEngine>;

/// Errors raised while binding or serving the plugin socket.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Raised when the socket cannot be prepared or bound.
    #[error("failed to bind plugin socket {path}: {message}")]
    Bind {
        /// Socket path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        message: String,
    },
    /// Raised when the server loop fails.
    #[error("plugin server failed: {0}")]
    Serve(String),
}

/// Builds the router for every plugin endpoint.
#[must_use]
pub fn router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/VolumeDriver.Create", post(create))
        .route("/VolumeDriver.Mount", post(mount))
        .route("/VolumeDriver.Path", post(path))
        .route("/VolumeDriver.Unmount", post(unmount))
        .route("/VolumeDriver.Remove", post(remove))
        .route("/VolumeDriver.Get", post(get))
        .route("/VolumeDriver.List", post(list))
        .route("/VolumeDriver.Capabilities", post(capabilities))
        .with_state(engine)
}

/// Binds `socket_path`, creating its directory and replacing a stale socket.
///
/// # Errors
///
/// Returns [`PluginError::Bind`] when the directory cannot be prepared or
/// the socket cannot be bound.
pub fn bind(socket_path: &Utf8Path) -> Result<UnixListener, PluginError> {
    let bind_error = |err: std::io::Error| PluginError::Bind {
        path: socket_path.to_owned(),
        message: err.to_string(),
    };

    if let (Some(parent), Some(name)) = (socket_path.parent(), socket_path.file_name()) {
        let dir_path = if parent.as_str().is_empty() {
            Utf8Path::new(".")
        } else {
            parent
        };
        Dir::create_ambient_dir_all(dir_path, ambient_authority()).map_err(bind_error)?;
        let dir = Dir::open_ambient_dir(dir_path, ambient_authority()).map_err(bind_error)?;
        if dir.try_exists(name).map_err(bind_error)? {
            warn!(socket = %socket_path, "removing stale plugin socket");
            dir.remove_file(name).map_err(bind_error)?;
        }
    }

    let listener = UnixListener::bind(socket_path).map_err(bind_error)?;
    info!(socket = %socket_path, "plugin socket bound");
    Ok(listener)
}

/// Serves the plugin protocol on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`PluginError::Serve`] when the server loop fails.
pub async fn serve<F>(
    listener: UnixListener,
    engine: SharedEngine,
    shutdown: F,
) -> Result<(), PluginError>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| PluginError::Serve(err.to_string()))
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, String> {
    serde_json::from_slice(body).map_err(|err| format!("invalid request body: {err}"))
}

fn render_error(result: Result<(), VolumeError>) -> String {
    result.err().map(|err| err.to_string()).unwrap_or_default()
}

/// Drives an engine call on its own task so a client hanging up mid-request
/// never cancels the operation halfway through an attach or unmount.
async fn run_to_completion<T, F>(name: &str, operation: F) -> Result<T, VolumeError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, VolumeError>> + Send + 'static,
{
    tokio::spawn(operation).await.unwrap_or_else(|err| {
        Err(VolumeError::Interrupted {
            name: name.to_owned(),
            message: err.to_string(),
        })
    })
}

fn log_outcome<T>(endpoint: &str, name: &str, result: &Result<T, VolumeError>) {
    match result {
        Ok(_) => info!(endpoint, volume = name, "request done"),
        Err(err) => warn!(endpoint, volume = name, error = %err, "request failed"),
    }
}

#[expect(clippy::unused_async, reason = "axum handlers must be async")]
async fn activate() -> Json<ActivateResponse> {
    info!(endpoint = "Plugin.Activate", "plugin activated");
    Json(ActivateResponse {
        implements: vec!["VolumeDriver"],
    })
}

#[expect(clippy::unused_async, reason = "axum handlers must be async")]
async fn capabilities() -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        capabilities: Capabilities { scope: "local" },
    })
}

async fn create(State(engine): State<SharedEngine>, body: Bytes) -> Json<ErrResponse> {
    let request = match decode::<VolumeRequest>(&body) {
        Ok(request) => request,
        Err(err) => return Json(ErrResponse { err }),
    };
    let options = request
        .opts
        .as_ref()
        .map(CreateOptions::from_map)
        .unwrap_or_default();

    let name = request.name.clone();
    let result = run_to_completion(&request.name, async move {
        engine.create(&name, options).await
    })
    .await;
    log_outcome("VolumeDriver.Create", &request.name, &result);
    Json(ErrResponse {
        err: render_error(result),
    })
}

async fn mount(State(engine): State<SharedEngine>, body: Bytes) -> Json<MountpointResponse> {
    let request = match decode::<VolumeRequest>(&body) {
        Ok(request) => request,
        Err(err) => return Json(mountpoint_failure(err)),
    };
    info!(volume = %request.name, id = ?request.id, "mount requested");

    let name = request.name.clone();
    let result = run_to_completion(&request.name, async move {
        engine.mount(&name).await
    })
    .await;
    log_outcome("VolumeDriver.Mount", &request.name, &result);
    Json(mountpoint_response(result))
}

async fn path(State(engine): State<SharedEngine>, body: Bytes) -> Json<MountpointResponse> {
    let request = match decode::<VolumeRequest>(&body) {
        Ok(request) => request,
        Err(err) => return Json(mountpoint_failure(err)),
    };

    let result = engine.path(&request.name).await;
    log_outcome("VolumeDriver.Path", &request.name, &result);
    Json(mountpoint_response(result))
}

async fn unmount(State(engine): State<SharedEngine>, body: Bytes) -> Json<ErrResponse> {
    let request = match decode::<VolumeRequest>(&body) {
        Ok(request) => request,
        Err(err) => return Json(ErrResponse { err }),
    };
    info!(volume = %request.name, id = ?request.id, "unmount requested");

    let name = request.name.clone();
    let result = run_to_completion(&request.name, async move {
        engine.unmount(&name).await
    })
    .await;
    log_outcome("VolumeDriver.Unmount", &request.name, &result);
    Json(ErrResponse {
        err: render_error(result),
    })
}

async fn remove(State(engine): State<SharedEngine>, body: Bytes) -> Json<ErrResponse> {
    let request = match decode::<VolumeRequest>(&body) {
        Ok(request) => request,
        Err(err) => return Json(ErrResponse { err }),
    };

    let name = request.name.clone();
    let result = run_to_completion(&request.name, async move {
        engine.remove(&name).await
    })
    .await;
    log_outcome("VolumeDriver.Remove", &request.name, &result);
    Json(ErrResponse {
        err: render_error(result),
    })
}

async fn get(State(engine): State<SharedEngine>, body: Bytes) -> Json<GetResponse> {
    let request = match decode::<VolumeRequest>(&body) {
        Ok(request) => request,
        Err(err) => return Json(GetResponse { volume: None, err }),
    };

    Json(engine.get(&request.name).await.map_or_else(
        |err| GetResponse {
            volume: None,
            err: err.to_string(),
        },
        |record| GetResponse {
            volume: Some(VolumeInfo::from(record)),
            err: String::new(),
        },
    ))
}

async fn list(State(engine): State<SharedEngine>) -> Json<ListResponse> {
    Json(engine.list().await.map_or_else(
        |err| ListResponse {
            volumes: Vec::new(),
            err: err.to_string(),
        },
        |records| ListResponse {
            volumes: records.into_iter().map(VolumeInfo::from).collect(),
            err: String::new(),
        },
    ))
}

const fn mountpoint_failure(err: String) -> MountpointResponse {
    MountpointResponse {
        mountpoint: String::new(),
        err,
    }
}

fn mountpoint_response(result: Result<Utf8PathBuf, VolumeError>) -> MountpointResponse {
    result.map_or_else(
        |err| mountpoint_failure(err.to_string()),
        |mountpoint| MountpointResponse {
            mountpoint: mountpoint.into_string(),
            err: String::new(),
        },
    )
}
