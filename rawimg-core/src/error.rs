use crate::digest::DigestAlgorithm;
use std::io;

/// Errors that end a transfer or prevent it from starting.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("another transfer is already running")]
    Busy,

    #[error("invalid transfer job: {0}")]
    InvalidJob(String),

    #[error("failed to read from source: {0}")]
    SourceRead(#[source] io::Error),

    #[error("failed to write to destination: {0}")]
    SinkWrite(#[source] io::Error),

    #[error("device disappeared during the transfer: {0}")]
    DeviceVanished(#[source] io::Error),

    #[error("source ended after {actual} of {expected} bytes")]
    ShortRead { expected: u64, actual: u64 },

    #[error("image is larger than the target device ({device_size} bytes)")]
    ImageTooLarge { device_size: u64 },

    #[error("target device ({target_size} bytes) is smaller than the source ({source_size} bytes)")]
    TargetTooSmall { source_size: u64, target_size: u64 },

    #[error("{algorithm} verification failed: expected {expected}, got {actual}")]
    DigestMismatch {
        algorithm: DigestAlgorithm,
        expected: String,
        actual: String,
    },

    #[error("failed to start transfer worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("transfer worker panicked")]
    WorkerPanicked,
}

impl TransferError {
    /// Classifies an error raised while reading the source.
    pub(crate) fn from_source(e: io::Error) -> Self {
        if is_vanished(&e) {
            TransferError::DeviceVanished(e)
        } else {
            TransferError::SourceRead(e)
        }
    }

    /// Classifies an error raised while writing the destination.
    pub(crate) fn from_sink(e: io::Error) -> Self {
        if is_vanished(&e) {
            TransferError::DeviceVanished(e)
        } else {
            TransferError::SinkWrite(e)
        }
    }
}

/// Whether `e` looks like removable media going away mid-run.
fn is_vanished(e: &io::Error) -> bool {
    #[cfg(target_os = "linux")]
    if e.raw_os_error() == Some(libc::ENOMEDIUM) {
        return true;
    }
    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(libc::ENODEV) | Some(libc::ENXIO)) {
        return true;
    }
    e.kind() == io::ErrorKind::NotFound
}
