//! Command-line interface definitions for the `blocker` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `blocker` daemon.
///
/// Settings come from `blocker.toml` and `BLOCKER_*` environment variables;
/// the flags below override the loaded values.
#[derive(Debug, Parser)]
#[command(
    name = "blocker",
    version,
    about = "Docker volume plugin that attaches and mounts EBS volumes on demand"
)]
pub(crate) struct Cli {
    /// Unix socket to serve the plugin protocol on.
    #[arg(long, value_name = "PATH")]
    pub(crate) socket_path: Option<String>,
    /// Directory under which volume mountpoints are created.
    #[arg(long, value_name = "DIR")]
    pub(crate) mount_root: Option<String>,
}
