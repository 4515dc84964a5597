//! The transfer orchestrator.
//!
//! A [`Pipeline`] runs at most one [`TransferJob`] at a time on a background
//! thread. The caller gets a [`RunHandle`] carrying a one-way stream of
//! [`Event`]s: any number of progress samples followed by exactly one
//! [`Event::Finished`] with the run's [`Outcome`].
//!
//! ```text
//! Idle ──submit──▶ Running ──▶ Completed | Cancelled | Failed ──▶ Idle
//! ```
//!
//! The pipeline is back to `Idle` before `Finished` is delivered, so the next
//! job can be submitted as soon as the outcome has been observed.

use crate::cancel::CancelToken;
use crate::error::TransferError;
use crate::io::DeviceIo;
use crate::job::{Direction, TransferJob};
use crate::rate::ProgressSample;
use crate::stages::Stop;
use crate::{clone, read, write};
use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug)]
pub enum Event {
    Progress(ProgressSample),
    Finished(Outcome),
}

/// What happened to the destination of a run that did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    /// The partial image was deleted; the destination path is as it was.
    Discarded,
    /// A device was being written and may now hold a partial copy.
    DeviceIndeterminate,
}

/// Details of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// Plaintext bytes moved from source to destination.
    pub bytes: u64,
    /// Lowercase hex digest of those bytes, when hashing was enabled.
    pub digest: Option<String>,
    /// Sidecar written next to a backup image.
    pub sidecar: Option<PathBuf>,
    /// Most chunks that were ever waiting in the queue at once.
    pub peak_queued_chunks: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum Outcome {
    Completed(TransferSummary),
    Cancelled { rollback: Rollback },
    Failed {
        error: TransferError,
        rollback: Rollback,
    },
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled { .. })
    }

    /// Whether a device may have been left partially written.
    pub fn device_may_be_partial(&self) -> bool {
        matches!(
            self,
            Outcome::Cancelled {
                rollback: Rollback::DeviceIndeterminate
            } | Outcome::Failed {
                rollback: Rollback::DeviceIndeterminate,
                ..
            }
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed(summary) => write!(f, "completed ({} bytes)", summary.bytes),
            Outcome::Cancelled {
                rollback: Rollback::Discarded,
            } => f.write_str("cancelled; partial image discarded"),
            Outcome::Cancelled {
                rollback: Rollback::DeviceIndeterminate,
            } => f.write_str("cancelled; device may be partially written"),
            Outcome::Failed {
                error,
                rollback: Rollback::Discarded,
            } => write!(f, "failed: {error}; partial image discarded"),
            Outcome::Failed {
                error,
                rollback: Rollback::DeviceIndeterminate,
            } => write!(f, "failed: {error}; device may be partially written"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
}

/// Runs transfer jobs one at a time.
#[derive(Clone)]
pub struct Pipeline {
    io: Arc<dyn DeviceIo>,
    running: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(io: Arc<dyn DeviceIo>) -> Self {
        Self {
            io,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> PipelineState {
        if self.running.load(Ordering::SeqCst) {
            PipelineState::Running
        } else {
            PipelineState::Idle
        }
    }

    /// Starts `job` on a background thread.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Busy`] while another job is running and
    /// [`TransferError::InvalidJob`] for a job that cannot be run at all.
    pub fn submit(&self, job: TransferJob) -> Result<RunHandle, TransferError> {
        self.submit_with_token(job, CancelToken::new())
    }

    /// Like [`submit`](Self::submit), but the run observes `cancel`, which the
    /// caller may already have handed to a signal handler. The token must not
    /// be shared with another run.
    pub fn submit_with_token(
        &self,
        job: TransferJob,
        cancel: CancelToken,
    ) -> Result<RunHandle, TransferError> {
        job.validate()?;

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransferError::Busy);
        }
        let guard = RunningGuard(Arc::clone(&self.running));

        let (tx, rx) = crossbeam_channel::unbounded();
        let rollback = rollback_for(&job);
        let io = Arc::clone(&self.io);
        let worker_cancel = cancel.clone();

        let thread = thread::Builder::new()
            .name("rawimg-pipeline".into())
            .spawn(move || {
                let outcome = execute(&job, io.as_ref(), &worker_cancel, &tx);
                drop(guard);
                let _ = tx.send(Event::Finished(outcome));
            })
            .map_err(TransferError::Spawn)?;

        Ok(RunHandle {
            events: rx,
            cancel,
            rollback,
            thread: Some(thread),
        })
    }
}

/// Clears the running flag when a run ends, including by panic.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The caller's side of a running job.
pub struct RunHandle {
    events: Receiver<Event>,
    cancel: CancelToken,
    rollback: Rollback,
    thread: Option<JoinHandle<()>>,
}

impl RunHandle {
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Requests cancellation. Returns `false` if it was already requested.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel()
    }

    /// A token that cancels this run, e.g. for a signal handler.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Blocks until the run ends, discarding progress events.
    pub fn wait(mut self) -> Outcome {
        let outcome = loop {
            match self.events.recv() {
                Ok(Event::Finished(outcome)) => break outcome,
                Ok(Event::Progress(_)) => continue,
                Err(_) => {
                    break Outcome::Failed {
                        error: TransferError::WorkerPanicked,
                        rollback: self.rollback,
                    };
                }
            }
        };
        self.join();
        outcome
    }

    /// Joins the orchestrator thread once `Finished` has been received.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn rollback_for(job: &TransferJob) -> Rollback {
    if job.writes_device() {
        Rollback::DeviceIndeterminate
    } else {
        Rollback::Discarded
    }
}

fn execute(
    job: &TransferJob,
    io: &dyn DeviceIo,
    cancel: &CancelToken,
    events: &Sender<Event>,
) -> Outcome {
    let span = tracing::info_span!("transfer", kind = %job.direction);
    let _entered = span.enter();
    tracing::info!(
        chunk_size = job.chunk_size,
        queue_capacity = job.queue_capacity,
        digest = %job.digest,
        compression = ?job.compression,
        "starting"
    );

    let result = match &job.direction {
        Direction::Backup { device, image } => read::run(job, device, image, io, cancel, events),
        Direction::Restore { image, device } => write::run(job, image, device, io, cancel, events),
        Direction::Clone { source, target } => clone::run(job, source, target, io, cancel, events),
    };

    let rollback = rollback_for(job);
    match result {
        Ok(summary) => {
            tracing::info!(
                bytes = summary.bytes,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "completed"
            );
            Outcome::Completed(summary)
        }
        Err(Stop::Cancelled) => {
            tracing::warn!(?rollback, "cancelled");
            Outcome::Cancelled { rollback }
        }
        Err(Stop::Failed(error)) => {
            tracing::error!(%error, ?rollback, "failed");
            Outcome::Failed { error, rollback }
        }
        Err(Stop::Abandoned) => Outcome::Failed {
            error: TransferError::WorkerPanicked,
            rollback,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::io::SyncWrite;
    use std::io::{self, Read};
    use std::sync::Mutex;

    /// A device whose reads block until released.
    struct GatedIo {
        gate: Arc<Mutex<()>>,
    }

    struct GatedReader {
        gate: Arc<Mutex<()>>,
    }

    impl Read for GatedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let _held = self.gate.lock().unwrap();
            buf.fill(0xAB);
            Ok(buf.len())
        }
    }

    impl DeviceIo for GatedIo {
        fn open_read(&self, _: &Device) -> io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(GatedReader {
                gate: Arc::clone(&self.gate),
            }))
        }

        fn open_write(&self, _: &Device) -> io::Result<Box<dyn SyncWrite>> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
    }

    #[test]
    fn rejects_second_job_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let pipeline = Pipeline::new(Arc::new(GatedIo {
            gate: Arc::clone(&gate),
        }));
        let device = Device::new("/dev/fake", "fake", 4096);

        let first = pipeline
            .submit(TransferJob::backup(device.clone(), dir.path().join("a.img")).chunk_size(1024))
            .unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);

        let second = pipeline.submit(TransferJob::backup(device.clone(), dir.path().join("b.img")));
        assert!(matches!(second, Err(TransferError::Busy)));

        drop(held);
        assert!(first.wait().is_completed());
        assert_eq!(pipeline.state(), PipelineState::Idle);

        let third = pipeline
            .submit(TransferJob::backup(device, dir.path().join("c.img")).chunk_size(1024))
            .unwrap();
        assert!(third.wait().is_completed());
    }

    #[test]
    fn invalid_job_does_not_occupy_pipeline() {
        let gate = Arc::new(Mutex::new(()));
        let pipeline = Pipeline::new(Arc::new(GatedIo { gate }));
        let job = TransferJob::backup(Device::new("/dev/fake", "fake", 0), "x.img");
        assert!(matches!(pipeline.submit(job), Err(TransferError::InvalidJob(_))));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn restore_open_failure_is_flagged_on_device() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("in.img");
        std::fs::write(&image, [0u8; 512]).unwrap();

        let pipeline = Pipeline::new(Arc::new(GatedIo {
            gate: Arc::new(Mutex::new(())),
        }));
        let outcome = pipeline
            .submit(TransferJob::restore(&image, Device::new("/dev/fake", "fake", 4096)))
            .unwrap()
            .wait();

        assert!(matches!(
            outcome,
            Outcome::Failed {
                error: TransferError::SinkWrite(_),
                rollback: Rollback::DeviceIndeterminate,
            }
        ));
        assert!(outcome.device_may_be_partial());
    }

    #[test]
    fn outcome_messages() {
        let cancelled = Outcome::Cancelled {
            rollback: Rollback::DeviceIndeterminate,
        };
        assert_eq!(
            cancelled.to_string(),
            "cancelled; device may be partially written"
        );
        let failed = Outcome::Failed {
            error: TransferError::Busy,
            rollback: Rollback::Discarded,
        };
        assert!(!failed.device_may_be_partial());
        assert!(failed.to_string().contains("partial image discarded"));
    }
}
