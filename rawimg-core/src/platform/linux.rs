use crate::device::Device;
use anyhow::{Context, Result, anyhow};
use nix::ioctl_read;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

// Sizes in /sys/block are always in 512-byte sectors.
const SYSFS_SECTOR: u64 = 512;

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to find the system drive's parent for exclusion.
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// Finds the first mount point of `device_name` or one of its partitions.
fn find_mount_point(disks: &sysinfo::Disks, device_name: &str) -> String {
    disks
        .iter()
        .filter(|disk| disk.name().to_string_lossy().contains(device_name))
        .map(|disk| disk.mount_point().to_string_lossy().to_string())
        .find(|mp| !mp.is_empty())
        .unwrap_or_default()
}

/// Scans for all removable block devices on a Linux system.
///
/// Devices are discovered by iterating through `/sys/block`. The main system
/// drive and loop devices are always skipped; of the rest, only devices whose
/// `removable` flag is set and whose size is non-zero (empty card readers
/// report zero) are returned.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let system_disk_parent = disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| get_parent_device_path(&PathBuf::from("/dev/").join(disk.name())))
        .ok_or_else(|| anyhow!("Could not determine system drive."))?;

    let mut devices = Vec::new();
    let block_dir = fs::read_dir("/sys/block").context("failed to list /sys/block")?;

    for entry in block_dir.filter_map(Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&device_name);

        if device_name.starts_with("loop") || device_path == system_disk_parent {
            continue;
        }

        let is_removable = read_sys_file(&device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);
        if !is_removable {
            continue;
        }

        let size_sectors = read_sys_file(&device_name, "size")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        if size_sectors == 0 {
            continue;
        }

        let label = read_sys_file(&device_name, "device/model")
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| device_name.clone());

        let mut device = Device::new(device_path, label, size_sectors * SYSFS_SECTOR);
        device.mount_point = find_mount_point(&disks, &device_name);
        tracing::debug!(device = %device.path.display(), size = device.size_bytes, "found removable device");
        devices.push(device);
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

/// Builds a descriptor for the device (or image-sized regular file) at `path`.
///
/// Block devices are measured with the `BLKGETSIZE64` ioctl; regular files
/// report their length.
pub fn probe_device(path: &Path) -> Result<Device> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let metadata = file.metadata()?;

    let is_block = metadata.file_type().is_block_device();
    let size_bytes = if is_block {
        let mut size: u64 = 0;
        // SAFETY: `file` is an open block device and `size` is a valid u64 out-pointer.
        unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }
            .with_context(|| format!("failed to query size of {}", path.display()))?;
        size
    } else {
        metadata.len()
    };

    if size_bytes == 0 {
        return Err(anyhow!("Device size is reported as zero"));
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let mut device = Device::new(path, name, size_bytes);
    if is_block {
        device.mount_point =
            find_mount_point(&sysinfo::Disks::new_with_refreshed_list(), &device.name);
    }
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_partitions() {
        assert_eq!(
            get_parent_device_path(Path::new("/dev/sda1")),
            PathBuf::from("/dev/sda")
        );
        assert_eq!(
            get_parent_device_path(Path::new("/dev/mmcblk0p2")),
            PathBuf::from("/dev/mmcblk0")
        );
        assert_eq!(
            get_parent_device_path(Path::new("/dev/nvme0n1p3")),
            PathBuf::from("/dev/nvme0n1")
        );
    }

    #[test]
    fn probes_regular_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card.bin");
        fs::write(&path, vec![0u8; 4096]).unwrap();

        let device = probe_device(&path).unwrap();
        assert_eq!(device.size_bytes, 4096);
        assert_eq!(device.name, "card.bin");
    }

    #[test]
    fn probe_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        fs::write(&path, b"").unwrap();
        assert!(probe_device(&path).is_err());
    }
}
