//! Description of one transfer run.

use crate::compress::Compression;
use crate::device::Device;
use crate::digest::DigestAlgorithm;
use crate::error::TransferError;
use crate::rate::DEFAULT_PROGRESS_INTERVAL;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default size of one chunk: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Default queue depth, in chunks. Together with the chunk size this caps the
/// memory a run may buffer at 128 MiB.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Device to image file.
    Backup { device: Device, image: PathBuf },
    /// Image file to device.
    Restore { image: PathBuf, device: Device },
    /// Device to device.
    Clone { source: Device, target: Device },
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Backup { .. } => f.write_str("backup"),
            Direction::Restore { .. } => f.write_str("restore"),
            Direction::Clone { .. } => f.write_str("clone"),
        }
    }
}

/// An immutable description of a run, built once and handed to
/// [`Pipeline::submit`](crate::pipeline::Pipeline::submit).
///
/// ```
/// use rawimg_core::{Compression, Device, DigestAlgorithm, TransferJob};
///
/// let card = Device::new("/dev/mmcblk0", "mmcblk0", 32 << 30);
/// let job = TransferJob::backup(card, "card.img.zst")
///     .digest(DigestAlgorithm::Md5)
///     .queue_capacity(4);
/// assert_eq!(job.compression, Compression::Zstd);
/// ```
#[derive(Clone, Debug)]
pub struct TransferJob {
    pub direction: Direction,
    pub chunk_size: usize,
    pub queue_capacity: usize,
    pub digest: DigestAlgorithm,
    pub compression: Compression,
    pub progress_interval: Duration,
}

impl TransferJob {
    fn with_direction(direction: Direction, compression: Compression) -> Self {
        Self {
            direction,
            chunk_size: DEFAULT_CHUNK_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            digest: DigestAlgorithm::default(),
            compression,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Backs `device` up to `image`. Compression follows the image extension.
    pub fn backup(device: Device, image: impl Into<PathBuf>) -> Self {
        let image = image.into();
        let compression = Compression::from_path(&image);
        Self::with_direction(Direction::Backup { device, image }, compression)
    }

    /// Restores `image` onto `device`. Decompression follows the image
    /// extension, and a sidecar digest next to the image is verified.
    pub fn restore(image: impl Into<PathBuf>, device: Device) -> Self {
        let image = image.into();
        let compression = Compression::from_path(&image);
        Self::with_direction(Direction::Restore { image, device }, compression)
    }

    /// Copies `source` onto `target`. Clones are never hashed or compressed.
    pub fn clone_device(source: Device, target: Device) -> Self {
        let mut job = Self::with_direction(Direction::Clone { source, target }, Compression::None);
        job.digest = DigestAlgorithm::None;
        job
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn queue_capacity(mut self, chunks: usize) -> Self {
        self.queue_capacity = chunks;
        self
    }

    /// Hash algorithm for the sidecar (backup) or verification (restore).
    /// `DigestAlgorithm::None` disables both.
    pub fn digest(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest = algorithm;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Whether a failed or cancelled run leaves a device partially written.
    pub fn writes_device(&self) -> bool {
        !matches!(self.direction, Direction::Backup { .. })
    }

    pub(crate) fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidJob("chunk size must be non-zero".into()));
        }
        if self.queue_capacity == 0 {
            return Err(TransferError::InvalidJob(
                "queue capacity must be at least one chunk".into(),
            ));
        }
        let devices: Vec<&Device> = match &self.direction {
            Direction::Backup { device, .. } | Direction::Restore { device, .. } => vec![device],
            Direction::Clone { source, target } => {
                if source.path == target.path {
                    return Err(TransferError::InvalidJob(
                        "source and target are the same device".into(),
                    ));
                }
                vec![source, target]
            }
        };
        if let Some(device) = devices.iter().find(|d| d.size_bytes == 0) {
            return Err(TransferError::InvalidJob(format!(
                "device {} reports a size of zero",
                device.path.display()
            )));
        }
        Ok(())
    }
}
