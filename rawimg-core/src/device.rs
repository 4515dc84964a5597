use std::fmt;
use std::path::PathBuf;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Describes a block device (or a regular file standing in for one).
///
/// Descriptors are produced by the discovery functions in [`crate::platform`]
/// and are immutable for the lifetime of a transfer. `size_bytes` is the source
/// of truth for how many bytes a backup reads and how many a restore may write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda` or `\\.\PhysicalDrive0`).
    pub path: PathBuf,
    /// Human-readable label, usually the kernel name (e.g. "sda").
    pub name: String,
    /// The total size of the device in bytes.
    pub size_bytes: u64,
    /// The primary mount point of the device, if any.
    pub mount_point: String,
}

impl Device {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            size_bytes,
            mount_point: String::new(),
        }
    }

    /// Size in GiB, for display.
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / GIB
    }

    pub fn is_mounted(&self) -> bool {
        !self.mount_point.is_empty()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if self.is_mounted() {
            format!("[Mounted at {}]", self.mount_point)
        } else {
            "[Not mounted]".to_string()
        };

        write!(
            f,
            "{:<15} {:<12} {:.1} GB {}",
            self.path.display(),
            self.name,
            self.size_gb(),
            mount_info
        )
    }
}
