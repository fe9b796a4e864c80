// ABOUTME: Loop device management for mounting hotspot disk images.
// ABOUTME: Wraps losetup, mknod, mount and umount through the Host abstraction.

use crate::host::{CommandLine, Host, HostError};
use serde::Deserialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Partition holding the hotspot data filesystem.
pub const DATA_PARTITION: u32 = 3;
pub const DATA_FILESYSTEM: &str = "ext4";

#[derive(Debug, Error)]
pub enum BlockDeviceError {
    #[error("no free loop device: {0}")]
    NoFreeDevice(String),

    #[error("partition metadata missing under {}", .0.display())]
    MissingSysfs(PathBuf),

    #[error("malformed device numbers in {}: {content:?}", .path.display())]
    MalformedDevNumbers { path: PathBuf, content: String },

    #[error("failed to parse losetup listing: {0}")]
    Listing(#[from] serde_json::Error),

    #[error("failed to mount {device} on {}: {stderr}", .mount_point.display())]
    Mount {
        device: LoopDevice,
        mount_point: PathBuf,
        stderr: String,
    },

    #[error("failed to unmount {}: {stderr}", .mount_point.display())]
    Unmount { mount_point: PathBuf, stderr: String },

    #[error("failed to detach {0}")]
    Detach(LoopDevice),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Host(#[from] HostError),
}

/// A loop device node such as `/dev/loop3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice(PathBuf);

impl LoopDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Kernel name, e.g. `loop3`.
    pub fn name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Node of partition `number`, e.g. `/dev/loop3p3`.
    pub fn partition(&self, number: u32) -> PathBuf {
        let mut path = self.0.clone().into_os_string();
        path.push(format!("p{number}"));
        PathBuf::from(path)
    }
}

impl fmt::Display for LoopDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// One entry of `losetup --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachedDevice {
    pub name: String,
    #[serde(rename = "back-file", default)]
    pub back_file: Option<String>,
}

#[derive(Deserialize)]
struct LosetupListing {
    #[serde(default)]
    loopdevices: Vec<AttachedDevice>,
}

/// Loop device operations on a host.
pub struct BlockDevices<'a, H: Host> {
    host: &'a H,
    sysfs_block: &'a Path,
}

impl<'a, H: Host> BlockDevices<'a, H> {
    pub fn new(host: &'a H, sysfs_block: &'a Path) -> Self {
        Self { host, sysfs_block }
    }

    /// First unused loop device.
    pub async fn get_free_device(&self) -> Result<LoopDevice, BlockDeviceError> {
        let output = self
            .host
            .run(&CommandLine::new("losetup").arg("-f"))
            .await
            .map_err(|e| BlockDeviceError::NoFreeDevice(e.to_string()))?;
        let path = output.stdout.trim();
        if path.is_empty() {
            return Err(BlockDeviceError::NoFreeDevice(
                "losetup reported no device".to_string(),
            ));
        }
        Ok(LoopDevice::new(path))
    }

    /// Attach `image` to `device` with partition scanning.
    ///
    /// Some hosts (containers, mostly) do not create partition nodes on scan;
    /// those are then created from the kernel's sysfs metadata.
    pub async fn attach(&self, image: &Path, device: &LoopDevice) -> Result<(), BlockDeviceError> {
        tracing::info!("Attaching {} to {}", image.display(), device);
        self.host
            .run(
                &CommandLine::new("losetup")
                    .arg("--partscan")
                    .arg(device.path().to_string_lossy())
                    .arg(image.to_string_lossy()),
            )
            .await?;

        if !device.partition(1).exists() {
            self.materialize_partitions(device).await?;
        }
        Ok(())
    }

    async fn materialize_partitions(&self, device: &LoopDevice) -> Result<(), BlockDeviceError> {
        let name = device.name();
        let sysfs_dir = self.sysfs_block.join(&name);
        let entries = std::fs::read_dir(&sysfs_dir)
            .map_err(|_| BlockDeviceError::MissingSysfs(sysfs_dir.clone()))?;

        let prefix = format!("{name}p");
        let mut partitions: Vec<(String, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let dev_file = entry.path().join("dev");
                (file_name.starts_with(&prefix) && dev_file.is_file())
                    .then_some((file_name, dev_file))
            })
            .collect();
        partitions.sort();

        if partitions.is_empty() {
            return Err(BlockDeviceError::MissingSysfs(sysfs_dir));
        }

        let dev_dir = device.path().parent().unwrap_or(Path::new("/dev"));
        for (partition, dev_file) in partitions {
            let content = std::fs::read_to_string(&dev_file).map_err(|source| {
                BlockDeviceError::Io {
                    path: dev_file.clone(),
                    source,
                }
            })?;
            let Some((major, minor)) = content.trim().split_once(':') else {
                return Err(BlockDeviceError::MalformedDevNumbers {
                    path: dev_file,
                    content,
                });
            };

            let node = dev_dir.join(&partition);
            tracing::debug!("Creating {} ({}:{})", node.display(), major, minor);
            self.host
                .run(
                    &CommandLine::new("mknod")
                        .arg(node.to_string_lossy())
                        .arg("b")
                        .arg(major)
                        .arg(minor),
                )
                .await?;
        }
        Ok(())
    }

    /// Detach `device` and remove leftover partition nodes.
    ///
    /// With `failsafe`, a failing `losetup --detach` is only logged and
    /// reported through the returned flag.
    pub async fn detach(
        &self,
        device: &LoopDevice,
        failsafe: bool,
    ) -> Result<bool, BlockDeviceError> {
        tracing::info!("Detaching {}", device);
        let command = CommandLine::new("losetup")
            .arg("--detach")
            .arg(device.path().to_string_lossy());
        let detached = if failsafe {
            self.host.run_failsafe(&command).await
        } else {
            self.host.run(&command).await?;
            true
        };

        if detached {
            self.remove_partition_nodes(device);
        }
        Ok(detached)
    }

    /// Partition nodes we created with mknod are not removed by the kernel.
    fn remove_partition_nodes(&self, device: &LoopDevice) {
        let Some(dev_dir) = device.path().parent() else {
            return;
        };
        let prefix = format!("{}p", device.name());
        let Ok(entries) = std::fs::read_dir(dev_dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if entry.file_name().to_string_lossy().starts_with(&prefix)
                && let Err(e) = std::fs::remove_file(entry.path())
                && e.kind() != io::ErrorKind::NotFound
            {
                tracing::warn!("Failed to remove {}: {}", entry.path().display(), e);
            }
        }
    }

    /// All attached loop devices.
    pub async fn list_attached(&self) -> Result<Vec<AttachedDevice>, BlockDeviceError> {
        let output = self
            .host
            .run(&CommandLine::new("losetup").arg("--json"))
            .await?;
        // No output at all when nothing is attached.
        if output.stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        let listing: LosetupListing = serde_json::from_str(&output.stdout)?;
        Ok(listing.loopdevices)
    }

    /// Loop device currently backed by `image`, if any.
    pub async fn find_device_for(
        &self,
        image: &Path,
    ) -> Result<Option<LoopDevice>, BlockDeviceError> {
        let wanted = std::fs::canonicalize(image).unwrap_or_else(|_| image.to_path_buf());
        let device = self
            .list_attached()
            .await?
            .into_iter()
            .find(|attached| {
                attached.back_file.as_deref().is_some_and(|back| {
                    // losetup flags images unlinked while attached.
                    let back = back.strip_suffix(" (deleted)").unwrap_or(back);
                    Path::new(back) == wanted || Path::new(back) == image
                })
            })
            .map(|attached| LoopDevice::new(attached.name));
        Ok(device)
    }

    pub async fn mount(
        &self,
        device: &LoopDevice,
        partition: u32,
        mount_point: &Path,
    ) -> Result<(), BlockDeviceError> {
        let node = device.partition(partition);
        tracing::info!("Mounting {} on {}", node.display(), mount_point.display());
        let output = self
            .host
            .exec(
                &CommandLine::new("mount")
                    .args(["-t", DATA_FILESYSTEM])
                    .arg(node.to_string_lossy())
                    .arg(mount_point.to_string_lossy()),
            )
            .await?;
        if !output.success() {
            return Err(BlockDeviceError::Mount {
                device: device.clone(),
                mount_point: mount_point.to_path_buf(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Flush pending writes then unmount.
    pub async fn unmount(&self, mount_point: &Path) -> Result<(), BlockDeviceError> {
        tracing::info!("Unmounting {}", mount_point.display());
        self.host
            .run(
                &CommandLine::new("sync")
                    .arg("-f")
                    .arg(mount_point.to_string_lossy()),
            )
            .await?;
        let output = self
            .host
            .exec(&CommandLine::new("umount").arg(mount_point.to_string_lossy()))
            .await?;
        if !output.success() {
            return Err(BlockDeviceError::Unmount {
                mount_point: mount_point.to_path_buf(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    pub async fn is_mounted(&self, path: &Path) -> bool {
        match self
            .host
            .exec(
                &CommandLine::new("mountpoint")
                    .arg("-q")
                    .arg(path.to_string_lossy()),
            )
            .await
        {
            Ok(output) => output.success(),
            Err(_) => false,
        }
    }

    /// Unmount `mount_point` and detach whatever device backs `image`.
    /// Does nothing for parts already released.
    pub async fn release(&self, image: &Path, mount_point: &Path) -> Result<(), BlockDeviceError> {
        if self.is_mounted(mount_point).await {
            self.unmount(mount_point).await?;
        }
        if let Some(device) = self.find_device_for(image).await?
            && !self.detach(&device, true).await?
        {
            return Err(BlockDeviceError::Detach(device));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_nodes_append_suffix() {
        let device = LoopDevice::new("/dev/loop12");
        assert_eq!(device.name(), "loop12");
        assert_eq!(device.partition(3), PathBuf::from("/dev/loop12p3"));
    }

    #[test]
    fn listing_tolerates_missing_back_file() {
        let listing: LosetupListing = serde_json::from_str(
            r#"{"loopdevices": [
                {"name": "/dev/loop0", "back-file": "/demo/ted/image.img"},
                {"name": "/dev/loop1"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(listing.loopdevices.len(), 2);
        assert_eq!(listing.loopdevices[1].back_file, None);
    }
}
