//! Binary entry point for the `blocker` volume plugin daemon.

mod cli;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blocker::plugin::{self, PluginError};
use blocker::{
    AttachCoordinator, AwsCliBlockStorage, BlockerConfig, CloudVolumeLookup, ConfigError,
    IdentityError, InstanceIdentity, MountManager, ProcessCommandRunner, VolumeCatalog,
    VolumeRegistry,
};

use cli::Cli;

#[derive(Debug, Error)]
enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        report_error(&err);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), DaemonError> {
    let mut config = BlockerConfig::load_without_cli_args()?;
    apply_overrides(&mut config, cli);
    config.validate()?;
    init_tracing(&config.log_level);

    let identity = resolve_identity(&config).await?;
    let storage = Arc::new(AwsCliBlockStorage::with_process_runner(
        &config.aws_bin,
        &identity.region,
    ));
    let coordinator = AttachCoordinator::new(
        Arc::clone(&storage),
        &identity,
        &config.device_root(),
        config.backoff(),
    );
    let mounts = MountManager::new(
        coordinator,
        ProcessCommandRunner,
        config.mount_root(),
        &config.filesystem,
    );
    let lookup = CloudVolumeLookup::new(storage, &identity, &config.service_tag_key);
    let registry = Arc::new(VolumeRegistry::new(mounts, lookup));

    let socket_path = config.socket_path();
    let listener = plugin::bind(&socket_path)?;
    info!(
        socket = %socket_path,
        mount_root = %config.mount_root,
        filesystem = %config.filesystem,
        "serving docker volume plugin"
    );
    plugin::serve(listener, Arc::clone(&registry) as plugin::SharedEngine, shutdown_signal())
        .await?;

    warn_still_mounted(registry.as_ref()).await;
    if let Err(err) = std::fs::remove_file(&socket_path) {
        warn!(socket = %socket_path, error = %err, "could not remove plugin socket");
    }
    info!("blocker stopped");
    Ok(())
}

fn apply_overrides(config: &mut BlockerConfig, cli: Cli) {
    if let Some(socket_path) = cli.socket_path {
        config.socket_path = socket_path;
    }
    if let Some(mount_root) = cli.mount_root {
        config.mount_root = mount_root;
    }
}

fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn resolve_identity(config: &BlockerConfig) -> Result<InstanceIdentity, IdentityError> {
    let identity = match config.static_identity() {
        Some(identity) => {
            info!("using configured instance identity");
            identity
        }
        None => InstanceIdentity::discover(&config.metadata_endpoint).await?,
    };
    info!(
        instance_id = %identity.instance_id,
        region = %identity.region,
        availability_zone = %identity.availability_zone,
        "instance identity"
    );
    Ok(identity)
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
    info!("shutdown requested");
}

/// Mounted volumes stay attached across a restart; name them for the operator.
async fn warn_still_mounted(catalog: &dyn VolumeCatalog) {
    let Ok(records) = catalog.list().await else {
        return;
    };
    let mounted = records
        .into_iter()
        .filter(|record| record.mountpoint.is_some())
        .map(|record| record.name)
        .collect::<Vec<_>>();
    if !mounted.is_empty() {
        warn!(volumes = ?mounted, "shutting down with volumes still mounted and attached");
    }
}

fn report_error(err: &DaemonError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &DaemonError) {
    writeln!(target, "blocker: {err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_loaded_values() {
        let mut config = BlockerConfig {
            socket_path: String::from("/run/docker/plugins/blocker.sock"),
            mount_root: String::from("/mnt/blocker"),
            device_root: String::from("/dev"),
            filesystem: String::from("ext4"),
            aws_bin: String::from("aws"),
            metadata_endpoint: String::from("http://169.254.169.254"),
            poll_attempts: 12,
            poll_interval_secs: 5,
            service_tag_key: String::from("service"),
            log_level: String::from("info"),
            instance_id: None,
            region: None,
            availability_zone: None,
        };
        let cli = Cli::parse_from(["blocker", "--mount-root", "/srv/volumes"]);

        apply_overrides(&mut config, cli);

        assert_eq!(config.mount_root, "/srv/volumes");
        assert_eq!(config.socket_path, "/run/docker/plugins/blocker.sock");
    }

    #[test]
    fn errors_are_written_with_program_prefix() {
        let mut buffer = Vec::new();
        let err = DaemonError::Config(ConfigError::Parse(String::from("bad toml")));

        write_error(&mut buffer, &err);

        assert_eq!(
            String::from_utf8_lossy(&buffer),
            "blocker: configuration parsing failed: bad toml\n"
        );
    }
}
