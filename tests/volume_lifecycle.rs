//! End-to-end lifecycle behaviour of the volume registry against the
//! in-memory control plane.

use blocker::test_support::{FAKE_ZONE, FakeHost};
use blocker::{CreateOptions, VolumeCatalog, VolumeDriver, VolumeError};
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Host {
    _dir: TempDir,
    root: Utf8PathBuf,
    fake: FakeHost,
}

#[fixture]
fn host() -> Host {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 tempdir {}", path.display()));
    let fake = FakeHost::new(&root, 3).unwrap_or_else(|err| panic!("fake host: {err}"));
    fake.storage.add_volume("vol-web", FAKE_ZONE, &[]);
    fake.storage.add_volume("vol-cache", FAKE_ZONE, &[]);
    fake.storage
        .add_volume("vol-db-remote", "us-east-1b", &[("service", "db")]);
    fake.storage
        .add_volume("vol-db-local", FAKE_ZONE, &[("service", "db")]);
    Host {
        _dir: dir,
        root,
        fake,
    }
}

#[rstest]
#[tokio::test]
async fn volume_round_trip_leaves_backing_volume_available(host: Host) {
    let registry = &host.fake.registry;
    registry
        .create("web", CreateOptions::with_volume_id("vol-web"))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    host.fake.runner.push_success();
    let mountpoint = registry
        .mount("web")
        .await
        .unwrap_or_else(|err| panic!("mount: {err}"));
    assert!(mountpoint.starts_with(&host.fake.mount_root));
    assert!(mountpoint.is_dir());
    assert_eq!(host.fake.storage.volume_state("vol-web").as_deref(), Some("in-use"));
    assert_eq!(
        registry.path("web").await,
        Ok(mountpoint.clone()),
        "path reports the live mountpoint"
    );

    host.fake.runner.push_success();
    registry
        .unmount("web")
        .await
        .unwrap_or_else(|err| panic!("unmount: {err}"));
    assert!(!mountpoint.exists());
    assert_eq!(
        host.fake.storage.volume_state("vol-web").as_deref(),
        Some("available")
    );

    registry
        .remove("web")
        .await
        .unwrap_or_else(|err| panic!("remove: {err}"));
    assert_eq!(
        registry.get("web").await,
        Err(VolumeError::NotFound {
            name: String::from("web"),
        })
    );
    assert_eq!(
        host.fake.runner.command_strings(),
        vec![
            format!("mount -t ext4 {}/dev/sdf {mountpoint}", host.root),
            format!("umount {mountpoint}"),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn concurrent_mounts_of_different_volumes_use_distinct_devices(host: Host) {
    let registry = &host.fake.registry;
    for (name, volume_id) in [("web", "vol-web"), ("cache", "vol-cache")] {
        registry
            .create(name, CreateOptions::with_volume_id(volume_id))
            .await
            .unwrap_or_else(|err| panic!("create {name}: {err}"));
    }
    host.fake.runner.push_success();
    host.fake.runner.push_success();

    let (web, cache) = tokio::join!(registry.mount("web"), registry.mount("cache"));

    let web_mount = web.unwrap_or_else(|err| panic!("mount web: {err}"));
    let cache_mount = cache.unwrap_or_else(|err| panic!("mount cache: {err}"));
    assert_ne!(web_mount, cache_mount);

    let mut devices = host.fake.storage.attach_requests();
    devices.sort();
    assert_eq!(devices, vec!["/dev/sdf", "/dev/sdg"]);
}

#[rstest]
#[tokio::test]
async fn service_option_picks_volume_in_local_zone(host: Host) {
    let registry = &host.fake.registry;
    registry
        .create("postgres", CreateOptions::with_service("db"))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    let record = registry
        .get("postgres")
        .await
        .unwrap_or_else(|err| panic!("get: {err}"));
    assert_eq!(record.volume_id, "vol-db-local");
    assert_eq!(record.mountpoint, None);
}

#[rstest]
#[tokio::test]
async fn busy_backing_volume_times_out_and_stays_unmounted(host: Host) {
    let registry = &host.fake.registry;
    host.fake.storage.set_state("vol-web", "in-use");
    registry
        .create("web", CreateOptions::with_volume_id("vol-web"))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    let err = registry
        .mount("web")
        .await
        .expect_err("volume attached elsewhere cannot be mounted");

    assert!(matches!(err, VolumeError::RemoteState { .. }), "got {err:?}");
    assert!(host.fake.storage.attach_requests().is_empty());
    assert!(host.fake.runner.invocations().is_empty());
    assert_eq!(
        registry.path("web").await,
        Err(VolumeError::NotMounted {
            name: String::from("web"),
        })
    );
}

#[rstest]
#[tokio::test]
async fn list_reports_mount_state_per_volume(host: Host) {
    let registry = &host.fake.registry;
    for (name, volume_id) in [("web", "vol-web"), ("cache", "vol-cache")] {
        registry
            .create(name, CreateOptions::with_volume_id(volume_id))
            .await
            .unwrap_or_else(|err| panic!("create {name}: {err}"));
    }
    host.fake.runner.push_success();
    let mountpoint = registry
        .mount("web")
        .await
        .unwrap_or_else(|err| panic!("mount: {err}"));

    let listed = registry
        .list()
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));

    let summary = listed
        .iter()
        .map(|record| (record.name.as_str(), record.mountpoint.clone()))
        .collect::<Vec<_>>();
    assert_eq!(summary, vec![("cache", None), ("web", Some(mountpoint))]);
}
