//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::ffi::OsString;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};

use crate::attach::{AttachCoordinator, BackoffPolicy};
use crate::backend::{
    AttachmentSnapshot, BackendFuture, BlockStorage, CloudError, DEVICE_IN_USE_CODE,
    VOLUME_NOT_FOUND_CODE, VOLUME_STATE_AVAILABLE, VolumeFilter, VolumeSnapshot,
};
use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::identity::InstanceIdentity;
use crate::lookup::{CloudVolumeLookup, DEFAULT_SERVICE_TAG_KEY};
use crate::mount::MountManager;
use crate::registry::VolumeRegistry;

/// Availability zone of the host modelled by [`FakeHost`].
pub const FAKE_ZONE: &str = "us-east-1a";

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Returns the invocations rendered with [`CommandInvocation::command_string`].
    #[must_use]
    pub fn command_strings(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// How [`FakeBlockStorage`] materialises device nodes after an attach.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DeviceNodeMode {
    /// Creates `sdX` under the device root.
    #[default]
    Primary,
    /// Creates the kernel-remapped `xvdX` alias instead.
    Alias,
    /// Creates nothing, simulating a device that never shows up.
    Missing,
}

#[derive(Debug)]
struct FakeVolume {
    snapshot: VolumeSnapshot,
    pending_attaching_polls: u32,
}

#[derive(Debug, Default)]
struct FakeState {
    volumes: Vec<FakeVolume>,
    busy_devices: BTreeSet<String>,
    device_root: Option<Utf8PathBuf>,
    node_mode: DeviceNodeMode,
    attaching_polls: u32,
    attach_failure: Option<CloudError>,
    fail_detach: bool,
    fail_find: bool,
    attach_requests: Vec<String>,
    detach_requests: Vec<String>,
    describe_calls: u32,
}

impl FakeState {
    fn volume_mut(&mut self, volume_id: &str) -> Option<&mut FakeVolume> {
        self.volumes
            .iter_mut()
            .find(|volume| volume.snapshot.id == volume_id)
    }

    fn node_path(&self, device: &str, alias: bool) -> Option<Utf8PathBuf> {
        let letter = device.strip_prefix("/dev/sd")?;
        let root = self.device_root.as_ref()?;
        let prefix = if alias { "xvd" } else { "sd" };
        Some(root.join(format!("{prefix}{letter}")))
    }
}

fn not_found(operation: &str, volume_id: &str) -> CloudError {
    CloudError::new(operation, format!("volume {volume_id} does not exist"))
        .with_code(VOLUME_NOT_FOUND_CODE)
}

/// In-memory control plane that models the asynchronous volume states.
#[derive(Clone, Debug, Default)]
pub struct FakeBlockStorage {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBlockStorage {
    /// Creates an empty control plane with no device root.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates device nodes under `root` on attach according to `mode`.
    #[must_use]
    pub fn with_device_root(self, root: &Utf8Path, mode: DeviceNodeMode) -> Self {
        {
            let mut state = lock(&self.state);
            state.device_root = Some(root.to_owned());
            state.node_mode = mode;
        }
        self
    }

    /// Registers an available volume in `zone` carrying `tags`.
    pub fn add_volume(&self, volume_id: &str, zone: &str, tags: &[(&str, &str)]) {
        lock(&self.state).volumes.push(FakeVolume {
            snapshot: VolumeSnapshot {
                id: volume_id.to_owned(),
                state: String::from(VOLUME_STATE_AVAILABLE),
                availability_zone: zone.to_owned(),
                attachments: Vec::new(),
                tags: tags
                    .iter()
                    .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                    .collect(),
            },
            pending_attaching_polls: 0,
        });
    }

    /// Forces the provider status of a volume (for example `in-use`).
    pub fn set_state(&self, volume_id: &str, state: &str) {
        if let Some(volume) = lock(&self.state).volume_mut(volume_id) {
            state.clone_into(&mut volume.snapshot.state);
        }
    }

    /// Makes the provider reject `device` as already in use.
    pub fn mark_device_busy(&self, device: &str) {
        lock(&self.state).busy_devices.insert(device.to_owned());
    }

    /// Number of describe calls reporting `attaching` after each attach.
    pub fn set_attaching_polls(&self, polls: u32) {
        lock(&self.state).attaching_polls = polls;
    }

    /// Fails every attach request with `error`.
    pub fn fail_attach(&self, error: CloudError) {
        lock(&self.state).attach_failure = Some(error);
    }

    /// Fails every detach request.
    pub fn fail_detach(&self) {
        lock(&self.state).fail_detach = true;
    }

    /// Fails every volume search.
    pub fn fail_find(&self) {
        lock(&self.state).fail_find = true;
    }

    /// Devices named in attach requests, in call order.
    #[must_use]
    pub fn attach_requests(&self) -> Vec<String> {
        lock(&self.state).attach_requests.clone()
    }

    /// Volume ids named in detach requests, in call order.
    #[must_use]
    pub fn detach_requests(&self) -> Vec<String> {
        lock(&self.state).detach_requests.clone()
    }

    /// Number of describe calls served so far.
    #[must_use]
    pub fn describe_calls(&self) -> u32 {
        lock(&self.state).describe_calls
    }

    /// Current provider status of `volume_id`.
    #[must_use]
    pub fn volume_state(&self, volume_id: &str) -> Option<String> {
        lock(&self.state)
            .volume_mut(volume_id)
            .map(|volume| volume.snapshot.state.clone())
    }
}

impl BlockStorage for FakeBlockStorage {
    fn describe_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> BackendFuture<'a, VolumeSnapshot, CloudError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.describe_calls += 1;
            let volume = state
                .volume_mut(volume_id)
                .ok_or_else(|| not_found("DescribeVolumes", volume_id))?;

            let mut snapshot = volume.snapshot.clone();
            if volume.pending_attaching_polls > 0 {
                volume.pending_attaching_polls -= 1;
                for attachment in &mut snapshot.attachments {
                    attachment.state = String::from("attaching");
                }
            }
            Ok(snapshot)
        })
    }

    fn find_volumes<'a>(
        &'a self,
        filter: &'a VolumeFilter,
    ) -> BackendFuture<'a, Vec<VolumeSnapshot>, CloudError> {
        Box::pin(async move {
            let state = lock(&self.state);
            if state.fail_find {
                return Err(CloudError::new("DescribeVolumes", "simulated failure"));
            }
            Ok(state
                .volumes
                .iter()
                .map(|volume| &volume.snapshot)
                .filter(|snapshot| filter.matches(snapshot))
                .cloned()
                .collect())
        })
    }

    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> BackendFuture<'a, (), CloudError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.attach_requests.push(device.to_owned());
            if let Some(err) = state.attach_failure.clone() {
                return Err(err);
            }
            if state.busy_devices.contains(device) {
                return Err(CloudError::new(
                    "AttachVolume",
                    format!("{device} is already in use"),
                )
                .with_code(DEVICE_IN_USE_CODE));
            }

            let polls = state.attaching_polls;
            let node = match state.node_mode {
                DeviceNodeMode::Primary => state.node_path(device, false),
                DeviceNodeMode::Alias => state.node_path(device, true),
                DeviceNodeMode::Missing => None,
            };
            let volume = state
                .volume_mut(volume_id)
                .ok_or_else(|| not_found("AttachVolume", volume_id))?;
            if volume.snapshot.state != VOLUME_STATE_AVAILABLE {
                return Err(CloudError::new(
                    "AttachVolume",
                    format!("volume {volume_id} is {}", volume.snapshot.state),
                )
                .with_code("IncorrectState"));
            }

            volume.snapshot.state = String::from("in-use");
            volume.snapshot.attachments = vec![AttachmentSnapshot {
                instance_id: instance_id.to_owned(),
                device: device.to_owned(),
                state: String::from("attached"),
            }];
            volume.pending_attaching_polls = polls;
            if let Some(path) = node {
                std::fs::write(&path, b"").map_err(|err| {
                    CloudError::new("AttachVolume", format!("fake device node {path}: {err}"))
                })?;
            }
            Ok(())
        })
    }

    fn detach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        _instance_id: &'a str,
    ) -> BackendFuture<'a, (), CloudError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.detach_requests.push(volume_id.to_owned());
            if state.fail_detach {
                return Err(CloudError::new("DetachVolume", "simulated failure"));
            }

            let volume = state
                .volume_mut(volume_id)
                .ok_or_else(|| not_found("DetachVolume", volume_id))?;
            let devices = volume
                .snapshot
                .attachments
                .drain(..)
                .map(|attachment| attachment.device)
                .collect::<Vec<_>>();
            volume.snapshot.state = String::from(VOLUME_STATE_AVAILABLE);

            for device in devices {
                for alias in [false, true] {
                    if let Some(path) = state.node_path(&device, alias) {
                        std::fs::remove_file(&path).ok();
                    }
                }
            }
            Ok(())
        })
    }
}

/// Registry wired to the in-memory control plane and a scripted runner.
#[derive(Debug)]
pub struct FakeHost {
    /// Control plane the registry talks to.
    pub storage: FakeBlockStorage,
    /// Runner receiving `mount` and `umount` invocations.
    pub runner: ScriptedRunner,
    /// Root under which mountpoints are created.
    pub mount_root: Utf8PathBuf,
    /// Engine under test.
    pub registry: Arc<VolumeRegistry<FakeBlockStorage, ScriptedRunner>>,
}

impl FakeHost {
    /// Builds a host in [`FAKE_ZONE`] whose device nodes and mountpoints
    /// live under `root`, polling `attempts` times without sleeping.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the device directory cannot be created.
    pub fn new(root: &Utf8Path, attempts: u32) -> std::io::Result<Self> {
        Self::with_backoff(root, BackoffPolicy::immediate(attempts))
    }

    /// Builds a host like [`FakeHost::new`] that polls with `backoff`, for
    /// tests that need an operation to stay in flight for a while.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the device directory cannot be created.
    pub fn with_backoff(root: &Utf8Path, backoff: BackoffPolicy) -> std::io::Result<Self> {
        let device_root = root.join("dev");
        std::fs::create_dir_all(&device_root)?;
        let mount_root = root.join("mnt");

        let storage =
            FakeBlockStorage::new().with_device_root(&device_root, DeviceNodeMode::Primary);
        let shared = Arc::new(storage.clone());
        let identity = InstanceIdentity::new("i-fake", "us-east-1", FAKE_ZONE);
        let coordinator = AttachCoordinator::new(
            Arc::clone(&shared),
            &identity,
            &device_root,
            backoff,
        );
        let runner = ScriptedRunner::new();
        let mounts = MountManager::new(coordinator, runner.clone(), mount_root.clone(), "ext4");
        let lookup = CloudVolumeLookup::new(shared, &identity, DEFAULT_SERVICE_TAG_KEY);

        Ok(Self {
            storage,
            runner,
            mount_root,
            registry: Arc::new(VolumeRegistry::new(mounts, lookup)),
        })
    }
}
