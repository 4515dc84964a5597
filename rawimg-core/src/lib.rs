//! The core, UI-agnostic library for the `rawimg` imaging utility.
//!
//! `rawimg-core` moves raw bytes between removable block devices and image
//! files. It can be driven by any front-end, whether a command-line interface
//! (like `rawimg`) or a graphical one, and handles device discovery, streaming
//! compression, integrity digests, throughput estimation and safe cancellation.
//!
//! The library is structured into several key modules:
//! - [`device`]: The cross-platform [`Device`] descriptor.
//! - [`platform`]: Platform-specific discovery of removable devices and the
//!   [`platform::RawDeviceIo`] handle provider.
//! - [`pipeline`]: The [`Pipeline`] that runs one [`TransferJob`] at a time and
//!   reports progress and the final [`Outcome`] as [`Event`]s.
//! - [`queue`], [`rate`], [`digest`], [`compress`], [`sink`]: the building
//!   blocks the pipeline is made of.
//!
//! Backups (device to image) are written to a temporary file and renamed into
//! place only when complete, so a cancelled or failed backup never leaves a
//! partial image at the destination. Restores (image to device) cannot be
//! rolled back; their outcome says so when they stop early.
//!
//! ## Example: Backing up a device with progress reporting
//!
//! ```rust,no_run
//! use rawimg_core::{Event, Outcome, Pipeline, TransferJob, platform};
//! use std::sync::Arc;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let devices = platform::get_removable_devices()?;
//!     let device = devices.first().expect("No removable devices found.").clone();
//!
//!     let pipeline = Pipeline::new(Arc::new(platform::RawDeviceIo));
//!     let run = pipeline.submit(TransferJob::backup(device, "card.img.gz"))?;
//!
//!     // `run.cancel()` (or a clone of `run.cancel_token()` handed to a signal
//!     // handler) stops the run and discards the partial image.
//!     for event in run.events() {
//!         match event {
//!             Event::Progress(p) => println!("{} / {} bytes", p.bytes_done, p.bytes_total),
//!             Event::Finished(Outcome::Completed(summary)) => {
//!                 println!("done, sha256 {}", summary.digest.unwrap_or_default());
//!                 break;
//!             }
//!             Event::Finished(other) => {
//!                 println!("{other}");
//!                 break;
//!             }
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
mod clone;
pub mod compress;
pub mod device;
pub mod digest;
pub mod error;
pub mod io;
pub mod job;
mod os_options;
pub mod pipeline;
pub mod platform;
pub mod queue;
pub mod rate;
mod read;
pub mod sink;
mod stages;
mod write;

pub use cancel::CancelToken;
pub use compress::Compression;
pub use device::Device;
pub use digest::DigestAlgorithm;
pub use error::TransferError;
pub use job::{DEFAULT_CHUNK_SIZE, DEFAULT_QUEUE_CAPACITY, Direction, TransferJob};
pub use pipeline::{Event, Outcome, Pipeline, PipelineState, Rollback, RunHandle, TransferSummary};
pub use rate::ProgressSample;
