//! Backup: reading a device into an image file.
//!
//! The device is read by one thread and the image written by another, with a
//! bounded queue between them. The image is written through an
//! [`AtomicSink`], so the destination path only ever holds a complete image.
//! Its digest sidecar is written before the image is committed, and a sidecar
//! that cannot be written fails the run while the image can still be
//! discarded.
use crate::cancel::CancelToken;
use crate::device::Device;
use crate::digest::{self, DigestAccumulator, DigestAlgorithm, StagedSidecar};
use crate::error::TransferError;
use crate::io::DeviceIo;
use crate::job::TransferJob;
use crate::pipeline::{Event, TransferSummary};
use crate::rate::RateEstimator;
use crate::sink::AtomicSink;
use crate::stages::{self, Stop};
use crossbeam_channel::Sender;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Reads all `device.size_bytes` bytes of `device` into `image`.
///
/// On cancellation or failure the partial image is removed and `image` is
/// left exactly as it was before the run.
pub(crate) fn run(
    job: &TransferJob,
    device: &Device,
    image: &Path,
    io: &dyn DeviceIo,
    cancel: &CancelToken,
    events: &Sender<Event>,
) -> Result<TransferSummary, Stop> {
    let started = Instant::now();
    let total = device.size_bytes;

    let source = io.open_read(device).map_err(TransferError::from_source)?;
    let sink = AtomicSink::prepare(image).map_err(TransferError::SinkWrite)?;
    let file = io
        .create_image(sink.temp_path())
        .map_err(TransferError::SinkWrite)?;
    let encoder = job
        .compression
        .encoder(file)
        .map_err(TransferError::SinkWrite)?;

    tracing::info!(
        device = %device.path.display(),
        image = %image.display(),
        bytes = total,
        "reading device"
    );

    let drained = stages::transfer(
        source,
        total,
        job.chunk_size,
        job.queue_capacity,
        encoder,
        DigestAccumulator::new(job.digest),
        RateEstimator::new(total, started, job.progress_interval),
        events,
        cancel,
    )?;
    let stages::Drained {
        consumed,
        sink: encoder,
        mut rate,
    } = drained;

    // A cancel that lands after the last chunk still rolls back.
    if cancel.is_cancelled() {
        return Err(Stop::Cancelled);
    }

    let file = encoder.finish().map_err(TransferError::SinkWrite)?;

    let algorithm = consumed.digest.algorithm();
    let digest = consumed.digest.finalize();
    let sidecar = match digest.as_deref() {
        Some(hex) => Some(publish_digest(image, algorithm, hex)?),
        None => None,
    };

    if let Err(e) = sink.commit(file) {
        if let Some(path) = &sidecar {
            discard_digest(path);
        }
        return Err(TransferError::SinkWrite(e).into());
    }
    if let Err(e) = digest::remove_other_sidecars(image, algorithm) {
        tracing::warn!(image = %image.display(), error = %e, "failed to remove stale digest");
    }

    let _ = events.send(Event::Progress(rate.finish(consumed.bytes, Instant::now())));

    Ok(TransferSummary {
        bytes: consumed.bytes,
        digest,
        sidecar,
        peak_queued_chunks: consumed.peak_queued,
        elapsed: started.elapsed(),
    })
}

/// Moves the digest of a finished, not yet committed image into its sidecar.
fn publish_digest(
    image: &Path,
    algorithm: DigestAlgorithm,
    hex: &str,
) -> Result<PathBuf, TransferError> {
    let mut staged =
        StagedSidecar::stage(image, algorithm, hex).map_err(TransferError::SinkWrite)?;
    staged.publish().map_err(TransferError::SinkWrite)?;
    tracing::info!(sidecar = %staged.path().display(), %algorithm, digest = hex, "wrote digest");
    Ok(staged.path().to_path_buf())
}

/// Removes a sidecar whose image never made it into place.
fn discard_digest(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(sidecar = %path.display(), error = %e, "failed to remove orphaned digest");
    }
}
