//! Reader and writer stages shared by backup and clone runs.

use crate::cancel::CancelToken;
use crate::digest::DigestAccumulator;
use crate::error::TransferError;
use crate::io::read_full;
use crate::pipeline::Event;
use crate::queue::{self, ChunkReceiver, ChunkSender, QueueClosed};
use crate::rate::RateEstimator;
use crossbeam_channel::Sender;
use std::io::{Read, Write};
use std::thread::{self, ScopedJoinHandle};
use std::time::Instant;

/// Why a stage stopped before finishing.
#[derive(Debug)]
pub(crate) enum Stop {
    Cancelled,
    Failed(TransferError),
    /// The peer stage went away; its own result carries the reason.
    Abandoned,
}

impl From<TransferError> for Stop {
    fn from(e: TransferError) -> Self {
        Stop::Failed(e)
    }
}

impl From<QueueClosed> for Stop {
    fn from(closed: QueueClosed) -> Self {
        match closed {
            QueueClosed::Cancelled => Stop::Cancelled,
            QueueClosed::Disconnected => Stop::Abandoned,
        }
    }
}

/// Reads exactly `total` bytes from `source` in `chunk_size` pieces and
/// pushes them, then marks the end of the stream.
///
/// Each chunk reserves its place in the queue before it is read, so the
/// reader never holds more than the queue's capacity of unwritten data.
pub(crate) fn produce(
    source: &mut dyn Read,
    total: u64,
    chunk_size: usize,
    queue: ChunkSender,
    cancel: &CancelToken,
) -> Result<u64, Stop> {
    let mut read = 0u64;
    while read < total {
        if cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }

        let permit = queue.reserve()?;
        let want = (chunk_size as u64).min(total - read) as usize;
        let mut chunk = vec![0u8; want];
        let n = read_full(source, &mut chunk).map_err(TransferError::from_source)?;
        if n < want {
            return Err(TransferError::ShortRead {
                expected: total,
                actual: read + n as u64,
            }
            .into());
        }

        read += n as u64;
        queue.push(permit, chunk)?;
    }
    queue.finish()?;
    tracing::debug!(bytes = read, "reader stage finished");
    Ok(read)
}

/// Bytes and digest accumulated by a successful writer stage.
pub(crate) struct Consumed {
    pub bytes: u64,
    pub digest: DigestAccumulator,
    pub peak_queued: usize,
}

/// Pops chunks until the end of the stream, hashing then writing each one and
/// reporting progress.
pub(crate) fn consume<W: Write + ?Sized>(
    queue: ChunkReceiver,
    sink: &mut W,
    mut digest: DigestAccumulator,
    rate: &mut RateEstimator,
    events: &Sender<Event>,
    cancel: &CancelToken,
) -> Result<Consumed, Stop> {
    let mut written = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(Stop::Cancelled);
        }
        let Some(chunk) = queue.pop()? else {
            break;
        };

        digest.update(&chunk);
        sink.write_all(&chunk).map_err(TransferError::from_sink)?;
        written += chunk.len() as u64;
        queue.release();

        if let Some(sample) = rate.observe(written, Instant::now()) {
            let _ = events.send(Event::Progress(sample));
        }
    }

    tracing::debug!(bytes = written, "writer stage finished");
    Ok(Consumed {
        bytes: written,
        digest,
        peak_queued: queue.peak_len(),
    })
}

/// What a two-stage run hands back once both stages succeeded.
pub(crate) struct Drained<W> {
    pub consumed: Consumed,
    pub sink: W,
    pub rate: RateEstimator,
}

/// Runs a reader thread and a writer thread connected by a bounded queue of
/// `queue_capacity` chunks, and waits for both.
#[allow(clippy::too_many_arguments)]
pub(crate) fn transfer<W: Write + Send>(
    mut source: Box<dyn Read + Send>,
    total: u64,
    chunk_size: usize,
    queue_capacity: usize,
    mut sink: W,
    digest: DigestAccumulator,
    mut rate: RateEstimator,
    events: &Sender<Event>,
    cancel: &CancelToken,
) -> Result<Drained<W>, Stop> {
    let (tx, rx) = queue::bounded(queue_capacity, cancel);

    thread::scope(|s| -> Result<Drained<W>, Stop> {
        let producer = thread::Builder::new()
            .name("rawimg-reader".into())
            .spawn_scoped(s, move || produce(source.as_mut(), total, chunk_size, tx, cancel))
            .map_err(TransferError::Spawn)?;

        let consumer = thread::Builder::new()
            .name("rawimg-writer".into())
            .spawn_scoped(s, move || -> Result<Drained<W>, Stop> {
                let consumed = consume(rx, &mut sink, digest, &mut rate, events, cancel)?;
                Ok(Drained {
                    consumed,
                    sink,
                    rate,
                })
            })
            .map_err(TransferError::Spawn)?;

        resolve(join(producer), join(consumer))
    })
}

pub(crate) fn join<T>(handle: ScopedJoinHandle<'_, Result<T, Stop>>) -> Result<T, Stop> {
    handle
        .join()
        .unwrap_or(Err(Stop::Failed(TransferError::WorkerPanicked)))
}

/// Combines the results of the two stages into one.
///
/// A real failure wins over cancellation, which wins over success; a stage
/// that merely noticed its peer leaving defers to the peer's result.
pub(crate) fn resolve<P, C>(
    producer: Result<P, Stop>,
    consumer: Result<C, Stop>,
) -> Result<C, Stop> {
    match (producer, consumer) {
        (Err(Stop::Failed(e)), _) | (_, Err(Stop::Failed(e))) => Err(Stop::Failed(e)),
        (Err(Stop::Cancelled), _) | (_, Err(Stop::Cancelled)) => Err(Stop::Cancelled),
        (Ok(_), Ok(c)) => Ok(c),
        // Both sides saw the other leave without a reason.
        _ => Err(Stop::Failed(TransferError::WorkerPanicked)),
    }
}
