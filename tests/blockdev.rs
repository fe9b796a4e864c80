// ABOUTME: Tests for loop device attachment, partition nodes and mounting.
// ABOUTME: Runs against the scripted host, with a variant that never creates partition nodes.

mod support;

use async_trait::async_trait;
use offspot_demo::blockdev::{BlockDeviceError, BlockDevices, DATA_PARTITION, LoopDevice};
use offspot_demo::host::{CommandLine, CommandOutput, Host, HostError};
use std::path::{Path, PathBuf};
use support::*;
use tempfile::TempDir;

/// Host whose partition scan leaves no partition nodes behind, like a
/// container without udev.
struct NoPartitionNodes(FakeHost);

#[async_trait]
impl Host for NoPartitionNodes {
    async fn exec(&self, command: &CommandLine) -> Result<CommandOutput, HostError> {
        let output = self.0.exec(command).await?;
        if let ("losetup", [flag, device, _]) = (command.program(), command.get_args())
            && flag == "--partscan"
        {
            for n in 1..=3 {
                let _ = std::fs::remove_file(format!("{device}p{n}"));
            }
        }
        Ok(output)
    }

    fn is_root(&self) -> bool {
        self.0.is_root()
    }
}

struct Setup {
    dir: TempDir,
    image: PathBuf,
    mount_point: PathBuf,
    sysfs: PathBuf,
}

fn setup() -> Setup {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("demo/wikipedia/image.img");
    std::fs::create_dir_all(image.parent().unwrap()).unwrap();
    std::fs::write(&image, DEFAULT_PAYLOAD).unwrap();
    let mount_point = dir.path().join("data/wikipedia");
    std::fs::create_dir_all(&mount_point).unwrap();
    let sysfs = dir.path().join("sys/block");

    Setup {
        dir,
        image,
        mount_point,
        sysfs,
    }
}

fn write_sysfs_partition(sysfs: &Path, device: &str, partition: u32, numbers: &str) {
    let dir = sysfs.join(device).join(format!("{device}p{partition}"));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("dev"), numbers).unwrap();
}

#[tokio::test]
async fn attach_mount_and_release() {
    let s = setup();
    let host = FakeHost::new(s.dir.path());
    let devices = BlockDevices::new(&host, &s.sysfs);

    let device = devices.get_free_device().await.unwrap();
    assert_eq!(device.path(), s.dir.path().join("dev/loop0"));
    devices.attach(&s.image, &device).await.unwrap();
    devices
        .mount(&device, DATA_PARTITION, &s.mount_point)
        .await
        .unwrap();

    assert!(devices.is_mounted(&s.mount_point).await);
    assert!(s.mount_point.join("image.yaml").exists());
    assert_eq!(devices.find_device_for(&s.image).await.unwrap(), Some(device.clone()));
    assert!(!host.ran("mknod"));

    devices.release(&s.image, &s.mount_point).await.unwrap();
    assert!(!devices.is_mounted(&s.mount_point).await);
    assert_eq!(host.attached_count(), 0);
    assert!(!device.partition(1).exists());
    assert!(host.ran(&format!("sync -f {}", s.mount_point.display())));
}

#[tokio::test]
async fn failed_sync_keeps_the_filesystem_mounted() {
    let s = setup();
    let host = FakeHost::new(s.dir.path());
    let devices = BlockDevices::new(&host, &s.sysfs);
    let device = devices.get_free_device().await.unwrap();
    devices.attach(&s.image, &device).await.unwrap();
    devices
        .mount(&device, DATA_PARTITION, &s.mount_point)
        .await
        .unwrap();
    host.fail("sync", 1);

    let err = devices.unmount(&s.mount_point).await.unwrap_err();
    assert!(matches!(err, BlockDeviceError::Host(_)), "{err}");
    assert!(!host.ran("umount"));
    assert!(devices.is_mounted(&s.mount_point).await);
}

#[tokio::test]
async fn next_free_device_skips_attached_ones() {
    let s = setup();
    let host = FakeHost::new(s.dir.path());
    let devices = BlockDevices::new(&host, &s.sysfs);

    let first = devices.get_free_device().await.unwrap();
    devices.attach(&s.image, &first).await.unwrap();
    let second = devices.get_free_device().await.unwrap();
    assert_eq!(second.name(), "loop1");
}

#[tokio::test]
async fn releasing_twice_is_harmless() {
    let s = setup();
    let host = FakeHost::new(s.dir.path());
    let devices = BlockDevices::new(&host, &s.sysfs);

    devices.release(&s.image, &s.mount_point).await.unwrap();
    devices.release(&s.image, &s.mount_point).await.unwrap();
    assert!(!host.ran("umount"));
    assert!(!host.ran("losetup --detach"));
}

#[tokio::test]
async fn image_unlinked_while_attached_is_still_found() {
    let s = setup();
    let host = FakeHost::new(s.dir.path());
    let devices = BlockDevices::new(&host, &s.sysfs);
    let device = devices.get_free_device().await.unwrap();
    devices.attach(&s.image, &device).await.unwrap();

    {
        let mut state = host.state();
        let back = &mut state.attached[0].1;
        *back = PathBuf::from(format!("{} (deleted)", back.display()));
    }

    assert_eq!(devices.find_device_for(&s.image).await.unwrap(), Some(device));
}

#[tokio::test]
async fn missing_partition_nodes_are_created_from_sysfs() {
    let s = setup();
    let host = NoPartitionNodes(FakeHost::new(s.dir.path()));
    write_sysfs_partition(&s.sysfs, "loop0", 1, "259:0\n");
    write_sysfs_partition(&s.sysfs, "loop0", 3, "259:2\n");
    let devices = BlockDevices::new(&host, &s.sysfs);

    let device = devices.get_free_device().await.unwrap();
    devices.attach(&s.image, &device).await.unwrap();

    let dev = s.dir.path().join("dev");
    assert!(host.0.ran(&format!("mknod {} b 259 0", dev.join("loop0p1").display())));
    assert!(host.0.ran(&format!("mknod {} b 259 2", dev.join("loop0p3").display())));
    assert_eq!(host.0.count("mknod"), 2);
}

#[tokio::test]
async fn missing_sysfs_metadata_is_an_error() {
    let s = setup();
    let host = NoPartitionNodes(FakeHost::new(s.dir.path()));
    let devices = BlockDevices::new(&host, &s.sysfs);

    let device = devices.get_free_device().await.unwrap();
    let err = devices.attach(&s.image, &device).await.unwrap_err();
    assert!(matches!(err, BlockDeviceError::MissingSysfs(_)), "{err}");
}

#[tokio::test]
async fn malformed_device_numbers_are_rejected() {
    let s = setup();
    let host = NoPartitionNodes(FakeHost::new(s.dir.path()));
    write_sysfs_partition(&s.sysfs, "loop0", 1, "garbage\n");
    let devices = BlockDevices::new(&host, &s.sysfs);

    let device = devices.get_free_device().await.unwrap();
    let err = devices.attach(&s.image, &device).await.unwrap_err();
    assert!(matches!(err, BlockDeviceError::MalformedDevNumbers { .. }), "{err}");
}

#[tokio::test]
async fn mount_failure_carries_tool_output() {
    let s = setup();
    let host = FakeHost::new(s.dir.path());
    let devices = BlockDevices::new(&host, &s.sysfs);

    let err = devices
        .mount(
            &LoopDevice::new(s.dir.path().join("dev/loop7")),
            DATA_PARTITION,
            &s.mount_point,
        )
        .await
        .unwrap_err();
    match err {
        BlockDeviceError::Mount { stderr, .. } => {
            assert_eq!(stderr, "special device does not exist")
        }
        other => panic!("unexpected error: {other}"),
    }
}
