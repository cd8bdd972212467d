//! Unit tests for device-slot selection and the attach exchange.

use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::backend::CloudError;
use crate::test_support::{DeviceNodeMode, FakeBlockStorage};

const VOLUME: &str = "vol-0001";
const ZONE: &str = "us-east-1a";

struct DeviceRoot {
    _dir: TempDir,
    path: Utf8PathBuf,
}

impl DeviceRoot {
    fn touch(&self, node: &str) {
        std::fs::write(self.path.join(node), b"")
            .unwrap_or_else(|err| panic!("create {node}: {err}"));
    }
}

#[fixture]
fn device_root() -> DeviceRoot {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 tempdir {}", path.display()));
    DeviceRoot { _dir: dir, path }
}

fn identity() -> InstanceIdentity {
    InstanceIdentity::new("i-test", "us-east-1", ZONE)
}

fn coordinator(
    root: &DeviceRoot,
    mode: DeviceNodeMode,
    attempts: u32,
) -> (FakeBlockStorage, AttachCoordinator<FakeBlockStorage>) {
    let storage = FakeBlockStorage::new().with_device_root(&root.path, mode);
    storage.add_volume(VOLUME, ZONE, &[]);
    let coordinator = AttachCoordinator::new(
        Arc::new(storage.clone()),
        &identity(),
        &root.path,
        BackoffPolicy::immediate(attempts),
    );
    (storage, coordinator)
}

#[test]
fn device_slots_cover_reserved_range() {
    let names = DeviceSlot::all()
        .map(DeviceSlot::request_name)
        .collect::<Vec<_>>();
    assert_eq!(names.len(), 11);
    assert_eq!(names.first().map(String::as_str), Some("/dev/sdf"));
    assert_eq!(names.last().map(String::as_str), Some("/dev/sdp"));
}

#[rstest]
#[tokio::test]
async fn attach_picks_lowest_free_letter(device_root: DeviceRoot) {
    device_root.touch("sdf");
    device_root.touch("xvdg");
    let (storage, coordinator) = coordinator(&device_root, DeviceNodeMode::Primary, 3);

    let device = coordinator
        .attach(VOLUME)
        .await
        .unwrap_or_else(|err| panic!("attach: {err}"));

    assert_eq!(device, device_root.path.join("sdh"));
    assert_eq!(storage.attach_requests(), vec![String::from("/dev/sdh")]);
    assert_eq!(storage.volume_state(VOLUME).as_deref(), Some("in-use"));
}

#[rstest]
#[tokio::test]
async fn remote_busy_devices_advance_the_scan(device_root: DeviceRoot) {
    let (storage, coordinator) = coordinator(&device_root, DeviceNodeMode::Primary, 3);
    storage.mark_device_busy("/dev/sdf");
    storage.mark_device_busy("/dev/sdg");

    let device = coordinator
        .attach(VOLUME)
        .await
        .unwrap_or_else(|err| panic!("attach: {err}"));

    assert_eq!(device, device_root.path.join("sdh"));
    assert_eq!(
        storage.attach_requests(),
        vec![
            String::from("/dev/sdf"),
            String::from("/dev/sdg"),
            String::from("/dev/sdh"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn every_local_node_present_means_no_free_device(device_root: DeviceRoot) {
    for slot in DeviceSlot::all() {
        device_root.touch(&slot.primary_node());
    }
    let (storage, coordinator) = coordinator(&device_root, DeviceNodeMode::Primary, 3);

    let err = coordinator.attach(VOLUME).await.expect_err("slots exhausted");

    assert_eq!(
        err,
        VolumeError::NoFreeDevice {
            first: String::from("/dev/sdf"),
            last: String::from("/dev/sdp"),
        }
    );
    assert!(storage.attach_requests().is_empty());
}

#[rstest]
#[tokio::test]
async fn every_remote_rejection_means_no_free_device(device_root: DeviceRoot) {
    let (storage, coordinator) = coordinator(&device_root, DeviceNodeMode::Primary, 3);
    for slot in DeviceSlot::all() {
        storage.mark_device_busy(&slot.request_name());
    }

    let err = coordinator.attach(VOLUME).await.expect_err("slots exhausted");

    assert!(matches!(err, VolumeError::NoFreeDevice { .. }));
    assert_eq!(storage.attach_requests().len(), DEVICE_LETTERS.len());
}

#[rstest]
#[tokio::test]
async fn alias_node_is_returned_when_primary_is_absent(device_root: DeviceRoot) {
    let (_storage, coordinator) = coordinator(&device_root, DeviceNodeMode::Alias, 3);

    let device = coordinator
        .attach(VOLUME)
        .await
        .unwrap_or_else(|err| panic!("attach: {err}"));

    assert_eq!(device, device_root.path.join("xvdf"));
}

#[rstest]
#[tokio::test]
async fn missing_node_detaches_and_fails(device_root: DeviceRoot) {
    let (storage, coordinator) = coordinator(&device_root, DeviceNodeMode::Missing, 3);

    let err = coordinator.attach(VOLUME).await.expect_err("node missing");

    assert_eq!(
        err,
        VolumeError::MissingDevice {
            device: device_root.path.join("sdf").into_string(),
        }
    );
    assert_eq!(storage.detach_requests(), vec![String::from(VOLUME)]);
    assert_eq!(storage.volume_state(VOLUME).as_deref(), Some("available"));
}

#[rstest]
#[tokio::test]
async fn unreadable_device_root_fails_before_attach(device_root: DeviceRoot) {
    device_root.touch("not-a-dir");
    let blocked = device_root.path.join("not-a-dir");
    let storage = FakeBlockStorage::new();
    storage.add_volume(VOLUME, ZONE, &[]);
    let coordinator = AttachCoordinator::new(
        Arc::new(storage.clone()),
        &identity(),
        &blocked,
        BackoffPolicy::immediate(2),
    );

    let err = coordinator.attach(VOLUME).await.expect_err("probe fails");

    let VolumeError::Filesystem { path, .. } = err else {
        panic!("expected Filesystem, got {err:?}");
    };
    assert_eq!(path, blocked);
    assert!(storage.attach_requests().is_empty());
}

#[rstest]
#[tokio::test]
async fn unavailable_volume_times_out_before_attach(device_root: DeviceRoot) {
    let (storage, coordinator) = coordinator(&device_root, DeviceNodeMode::Primary, 4);
    storage.set_state(VOLUME, "in-use");

    let err = coordinator.attach(VOLUME).await.expect_err("never available");

    let VolumeError::RemoteState { volume_id, message } = err else {
        panic!("expected RemoteState, got {err:?}");
    };
    assert_eq!(volume_id, VOLUME);
    assert!(message.contains("current is in-use"), "message: {message}");
    assert_eq!(storage.describe_calls(), 4);
    assert!(storage.attach_requests().is_empty());
}

#[rstest]
#[tokio::test]
async fn attaching_within_ceiling_succeeds(device_root: DeviceRoot) {
    let (storage, coordinator) = coordinator(&device_root, DeviceNodeMode::Primary, 4);
    storage.set_attaching_polls(3);

    let device = coordinator
        .attach(VOLUME)
        .await
        .unwrap_or_else(|err| panic!("attach: {err}"));

    assert_eq!(device, device_root.path.join("sdf"));
    assert_eq!(storage.describe_calls(), 5);
}

#[rstest]
#[tokio::test]
async fn attaching_beyond_ceiling_fails_without_detach(device_root: DeviceRoot) {
    let (storage, coordinator) = coordinator(&device_root, DeviceNodeMode::Primary, 2);
    storage.set_attaching_polls(5);

    let err = coordinator.attach(VOLUME).await.expect_err("never attached");

    let VolumeError::RemoteState { message, .. } = err else {
        panic!("expected RemoteState, got {err:?}");
    };
    assert!(message.contains("seeking attached, current is attaching"), "message: {message}");
    assert!(storage.detach_requests().is_empty());
}

#[rstest]
#[tokio::test]
async fn other_attach_errors_abort_the_scan(device_root: DeviceRoot) {
    let (storage, coordinator) = coordinator(&device_root, DeviceNodeMode::Primary, 3);
    storage.fail_attach(CloudError::new("AttachVolume", "denied").with_code("UnauthorizedOperation"));

    let err = coordinator.attach(VOLUME).await.expect_err("denied");

    assert!(matches!(err, VolumeError::RemoteState { .. }));
    assert_eq!(storage.attach_requests(), vec![String::from("/dev/sdf")]);
}

#[rstest]
#[tokio::test]
async fn concurrent_attaches_receive_distinct_devices(device_root: DeviceRoot) {
    let (storage, coordinator) = coordinator(&device_root, DeviceNodeMode::Primary, 3);
    storage.add_volume("vol-0002", ZONE, &[]);

    let (first, second) = tokio::join!(coordinator.attach(VOLUME), coordinator.attach("vol-0002"));
    let first = first.unwrap_or_else(|err| panic!("first attach: {err}"));
    let second = second.unwrap_or_else(|err| panic!("second attach: {err}"));

    assert_ne!(first, second);
    let mut requested = storage.attach_requests();
    requested.sort();
    assert_eq!(
        requested,
        vec![String::from("/dev/sdf"), String::from("/dev/sdg")]
    );
}

#[rstest]
#[tokio::test]
async fn detach_surfaces_control_plane_failure(device_root: DeviceRoot) {
    let (storage, coordinator) = coordinator(&device_root, DeviceNodeMode::Primary, 3);
    storage.fail_detach();

    let err = coordinator.detach(VOLUME).await.expect_err("detach fails");

    assert!(matches!(err, VolumeError::RemoteState { .. }));
}
