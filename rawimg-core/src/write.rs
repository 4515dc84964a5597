//! Restore: writing an image file to a device.
//!
//! Restores run on a single worker: each chunk is read from the image,
//! decompressed on the fly if needed, and written straight to the device.
//! A block device cannot be renamed into place, so unlike a backup there is no
//! rollback; a run that stops early leaves the device partially written and
//! says so in its outcome.
//!
//! If a digest sidecar sits next to the image, the bytes written are hashed
//! and compared against it once the device has been synced.
use crate::cancel::CancelToken;
use crate::compress;
use crate::device::Device;
use crate::digest::{self, DigestAccumulator, DigestAlgorithm};
use crate::error::TransferError;
use crate::io::{DeviceIo, read_full};
use crate::job::TransferJob;
use crate::pipeline::{Event, TransferSummary};
use crate::rate::RateEstimator;
use crate::stages::Stop;
use crossbeam_channel::Sender;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

pub(crate) fn run(
    job: &TransferJob,
    image: &Path,
    device: &Device,
    io: &dyn DeviceIo,
    cancel: &CancelToken,
    events: &Sender<Event>,
) -> Result<TransferSummary, Stop> {
    let started = Instant::now();
    let capacity = device.size_bytes;

    let expected = if job.digest.is_enabled() {
        digest::read_sidecar(image, job.digest).map_err(TransferError::SourceRead)?
    } else {
        None
    };

    // The plaintext size of a compressed image is unknown until it has been
    // read, so those are checked against the device as they stream.
    let total = if job.compression.is_enabled() {
        capacity
    } else {
        let len = fs::metadata(image)
            .map_err(TransferError::SourceRead)?
            .len();
        if len > capacity {
            return Err(TransferError::ImageTooLarge {
                device_size: capacity,
            }
            .into());
        }
        len
    };

    let mut source =
        compress::open_image(image, job.compression).map_err(TransferError::SourceRead)?;
    let mut target = io.open_write(device).map_err(TransferError::from_sink)?;

    tracing::info!(
        image = %image.display(),
        device = %device.path.display(),
        compression = ?job.compression,
        verify = expected.is_some(),
        "writing image"
    );

    let mut digest = DigestAccumulator::new(
        expected
            .as_ref()
            .map_or(DigestAlgorithm::None, |(algorithm, _)| *algorithm),
    );
    let mut rate = RateEstimator::new(total, started, job.progress_interval);
    let mut buffer = vec![0u8; job.chunk_size];
    let mut written: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }

        let n = read_full(source.as_mut(), &mut buffer).map_err(TransferError::SourceRead)?;
        if n == 0 {
            break;
        }
        if written + n as u64 > capacity {
            return Err(TransferError::ImageTooLarge {
                device_size: capacity,
            }
            .into());
        }

        target
            .write_all(&buffer[..n])
            .map_err(TransferError::from_sink)?;
        digest.update(&buffer[..n]);
        written += n as u64;

        if let Some(sample) = rate.observe(written, Instant::now()) {
            let _ = events.send(Event::Progress(sample));
        }
    }

    target.flush().map_err(TransferError::from_sink)?;
    target.sync().map_err(TransferError::from_sink)?;
    drop(target);

    let actual = digest.finalize();
    if let (Some((algorithm, expected)), Some(actual)) = (expected, actual.as_ref()) {
        if &expected != actual {
            return Err(TransferError::DigestMismatch {
                algorithm,
                expected,
                actual: actual.clone(),
            }
            .into());
        }
        tracing::info!(%algorithm, "verified written image");
    }

    let _ = events.send(Event::Progress(rate.finish(written, Instant::now())));

    Ok(TransferSummary {
        bytes: written,
        digest: actual,
        sidecar: None,
        peak_queued_chunks: 0,
        elapsed: started.elapsed(),
    })
}
