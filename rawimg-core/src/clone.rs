//! Clone: copying one device onto another through the bounded queue.
use crate::cancel::CancelToken;
use crate::device::Device;
use crate::digest::{DigestAccumulator, DigestAlgorithm};
use crate::error::TransferError;
use crate::io::DeviceIo;
use crate::job::TransferJob;
use crate::pipeline::{Event, TransferSummary};
use crate::rate::RateEstimator;
use crate::stages::{self, Stop};
use crossbeam_channel::Sender;
use std::io::Write;
use std::time::Instant;

pub(crate) fn run(
    job: &TransferJob,
    source: &Device,
    target: &Device,
    io: &dyn DeviceIo,
    cancel: &CancelToken,
    events: &Sender<Event>,
) -> Result<TransferSummary, Stop> {
    if target.size_bytes < source.size_bytes {
        return Err(TransferError::TargetTooSmall {
            source_size: source.size_bytes,
            target_size: target.size_bytes,
        }
        .into());
    }

    let started = Instant::now();
    let total = source.size_bytes;
    let reader = io.open_read(source).map_err(TransferError::from_source)?;
    let writer = io.open_write(target).map_err(TransferError::from_sink)?;

    tracing::info!(
        source = %source.path.display(),
        target = %target.path.display(),
        bytes = total,
        "cloning device"
    );

    let stages::Drained {
        consumed,
        sink: mut writer,
        mut rate,
    } = stages::transfer(
        reader,
        total,
        job.chunk_size,
        job.queue_capacity,
        writer,
        DigestAccumulator::new(DigestAlgorithm::None),
        RateEstimator::new(total, started, job.progress_interval),
        events,
        cancel,
    )?;

    writer.flush().map_err(TransferError::from_sink)?;
    writer.sync().map_err(TransferError::from_sink)?;

    let _ = events.send(Event::Progress(rate.finish(consumed.bytes, Instant::now())));

    Ok(TransferSummary {
        bytes: consumed.bytes,
        digest: None,
        sidecar: None,
        peak_queued_chunks: consumed.peak_queued,
        elapsed: started.elapsed(),
    })
}
