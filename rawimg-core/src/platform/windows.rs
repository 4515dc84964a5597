use crate::device::Device;
use anyhow::{Context, Result, anyhow};
use std::fs;
use std::path::Path;

/// Scans for all removable block devices on a Windows system.
///
/// # Errors
///
/// Discovery is not implemented on Windows yet; pass a device path explicitly.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    // TODO: enumerate disks with `SetupDiGetClassDevsW` and read their size
    // via `IOCTL_DISK_GET_LENGTH_INFO`.
    Err(anyhow!(
        "Removable device discovery is not yet supported on Windows."
    ))
}

/// Builds a descriptor for the file at `path` from its length.
pub fn probe_device(path: &Path) -> Result<Device> {
    let size_bytes = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if size_bytes == 0 {
        return Err(anyhow!("Device size is reported as zero"));
    }
    let name = path.display().to_string();
    Ok(Device::new(path, name, size_bytes))
}
