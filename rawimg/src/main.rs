use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressStyle};
use rawimg_core::device::Device;
use rawimg_core::{
    CancelToken, DEFAULT_QUEUE_CAPACITY, DigestAlgorithm, Event, Outcome, Pipeline,
    ProgressSample, TransferJob, platform,
};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

const MIB: usize = 1024 * 1024;

#[derive(Parser)]
#[command(name = "rawimg")]
#[command(about = "Back up, restore and clone removable block devices", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available removable devices
    List,
    /// Read a device into an image file (.gz, .xz and .zst are compressed)
    Backup {
        /// Output image file
        #[arg(required = true)]
        image: PathBuf,

        /// Source device; prompts for one when omitted
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Digest written next to the image: sha256, md5 or none
        #[arg(long = "hash", default_value = "sha256")]
        hash: DigestAlgorithm,

        #[command(flatten)]
        tuning: Tuning,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Write an image file to a device
    Restore {
        /// Image file to write
        #[arg(required = true)]
        image: PathBuf,

        /// Target device; prompts for one when omitted
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Skip verification against the image's digest sidecar
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        #[command(flatten)]
        tuning: Tuning,

        #[arg(short, long)]
        yes: bool,
    },
    /// Copy one device onto another
    Clone {
        #[arg(short, long)]
        source: Option<PathBuf>,

        #[arg(short, long)]
        target: Option<PathBuf>,

        #[command(flatten)]
        tuning: Tuning,

        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(clap::Args)]
struct Tuning {
    /// Chunk size in MiB
    #[arg(long = "chunk-size", default_value_t = 8, value_parser = clap::value_parser!(u16).range(1..=256))]
    chunk_mib: u16,

    /// Chunks buffered between the reader and the writer
    #[arg(long = "queue-depth", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_depth: usize,
}

impl Tuning {
    fn apply(&self, job: TransferJob) -> TransferJob {
        job.chunk_size(usize::from(self.chunk_mib) * MIB)
            .queue_capacity(self.queue_depth)
    }
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// Disabling it keeps the progress bar intact when the user cancels; the
/// original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }
            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Uses the device at `path` when given, otherwise asks the user to pick one.
fn resolve_device(path: Option<&Path>, prompt: &str) -> Result<Device> {
    match path {
        Some(path) => platform::probe_device(path),
        None => select_device(&platform::get_removable_devices()?, prompt),
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn progress_bar(prefix: &'static str, color: &str) -> Result<ProgressBar> {
    let bar = ProgressBar::new(0);
    bar.set_prefix(prefix);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{msg}})"
            ))?
            .progress_chars("■ "),
    );
    Ok(bar)
}

fn show_sample(bar: &ProgressBar, sample: &ProgressSample) {
    bar.set_length(sample.bytes_total);
    bar.set_position(sample.bytes_done);
    let eta = sample
        .eta
        .map_or_else(|| "--".to_string(), |eta| HumanDuration(eta).to_string());
    bar.set_message(format!(
        "{}/s, {eta}",
        HumanBytes(sample.throughput_bps as u64)
    ));
}

/// Submits `job`, drives the progress bar from its events and reports how the
/// run ended.
fn run_job(job: TransferJob, bar: ProgressBar) -> Result<Outcome> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if handler_token.cancel() {
            eprintln!("\nCancelling...");
        }
    })?;

    let pipeline = Pipeline::new(Arc::new(platform::RawDeviceIo));
    let mut run = pipeline.submit_with_token(job, cancel)?;

    let mut outcome = None;
    for event in run.events() {
        match event {
            Event::Progress(sample) => show_sample(&bar, &sample),
            Event::Finished(finished) => {
                outcome = Some(finished);
                break;
            }
        }
    }
    run.join();

    match outcome {
        Some(outcome @ Outcome::Completed(_)) => {
            bar.finish_with_message("done");
            Ok(outcome)
        }
        Some(outcome) => {
            bar.abandon();
            Ok(outcome)
        }
        None => {
            bar.abandon();
            Err(anyhow!("transfer worker exited without reporting an outcome"))
        }
    }
}

/// Prints a failed or cancelled outcome and turns it into an error.
fn report_unfinished(outcome: Outcome) -> Result<()> {
    if outcome.device_may_be_partial() {
        println!(
            "\n{} The device may be partially written and should not be trusted.",
            style("WARNING:").red().bold()
        );
    }
    match outcome {
        Outcome::Completed(_) => Ok(()),
        Outcome::Cancelled { .. } => {
            println!("Operation cancelled.");
            Err(anyhow!("{outcome}"))
        }
        Outcome::Failed { .. } => Err(anyhow!("{outcome}")),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_logging();

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    let cli = Cli::parse();

    match cli.command {
        Commands::Backup {
            image,
            device,
            hash,
            tuning,
            yes,
        } => {
            let device = resolve_device(device.as_deref(), "Select the source device to READ from")?;

            println!(
                "This will read {:.1} GB from '{}'.",
                device.size_gb(),
                device.name
            );
            println!("  Device: {}", style(device.path.display()).cyan());
            println!("  Output: {}", style(image.display()).cyan());
            println!();

            if !confirm_operation("Are you sure you want to proceed?", yes)? {
                println!("Backup cancelled.");
                return Ok(());
            }
            println!();

            let job = tuning.apply(TransferJob::backup(device.clone(), &image).digest(hash));
            match run_job(job, progress_bar("Reading", "green")?)? {
                Outcome::Completed(summary) => {
                    println!(
                        "\n✨ Successfully read {} to {}.",
                        style(device.path.display()).cyan(),
                        style(image.display()).cyan()
                    );
                    if let (Some(digest), Some(sidecar)) = (summary.digest, summary.sidecar) {
                        println!("  {hash}: {digest} ({})", sidecar.display());
                    }
                }
                other => return report_unfinished(other),
            }
        }
        Commands::Restore {
            image,
            device,
            no_verify,
            tuning,
            yes,
        } => {
            if !image.is_file() {
                return Err(anyhow!("Image '{}' does not exist.", image.display()));
            }
            let device = resolve_device(device.as_deref(), "Select the target device to WRITE to")?;

            println!(
                "{} This will erase all data on '{}' ({:.1} GB).",
                style("WARNING:").red().bold(),
                device.name,
                device.size_gb(),
            );
            if device.is_mounted() {
                println!(
                    "{} The device is mounted at {}; unmount it first.",
                    style("NOTE:").yellow().bold(),
                    device.mount_point
                );
            }
            println!("  Device: {}", style(device.path.display()).cyan());
            println!("  Image:  {}", style(image.display()).cyan());
            println!();

            if !confirm_operation("Are you sure you want to proceed?", yes)? {
                println!("Restore cancelled.");
                return Ok(());
            }
            println!();

            let mut job = tuning.apply(TransferJob::restore(&image, device.clone()));
            if no_verify {
                job = job.digest(DigestAlgorithm::None);
            }
            match run_job(job, progress_bar("Writing", "green")?)? {
                Outcome::Completed(summary) => {
                    println!(
                        "\n✨ Successfully flashed {} with {}.",
                        style(device.path.display()).cyan(),
                        style(image.display()).cyan()
                    );
                    match summary.digest {
                        Some(digest) => println!("  Verified: {digest}"),
                        None if !no_verify => {
                            println!("  No digest sidecar found; the write was not verified.")
                        }
                        None => {}
                    }
                }
                other => return report_unfinished(other),
            }
        }
        Commands::Clone {
            source,
            target,
            tuning,
            yes,
        } => {
            let source = resolve_device(source.as_deref(), "Select the SOURCE device")?;
            let target = resolve_device(target.as_deref(), "Select the TARGET device to overwrite")?;

            println!(
                "{} This will erase all data on '{}' ({:.1} GB).",
                style("WARNING:").red().bold(),
                target.name,
                target.size_gb(),
            );
            println!("  Source: {}", style(source.path.display()).cyan());
            println!("  Target: {}", style(target.path.display()).cyan());
            println!();

            if !confirm_operation("Are you sure you want to proceed?", yes)? {
                println!("Clone cancelled.");
                return Ok(());
            }
            println!();

            let job = tuning.apply(TransferJob::clone_device(source.clone(), target.clone()));
            match run_job(job, progress_bar("Cloning", "magenta")?)? {
                Outcome::Completed(_) => println!(
                    "\n✨ Successfully cloned {} to {}.",
                    style(source.path.display()).cyan(),
                    style(target.path.display()).cyan()
                ),
                other => return report_unfinished(other),
            }
        }
        Commands::List => {
            let devices = platform::get_removable_devices()?;
            if devices.is_empty() {
                println!("No removable devices found.");
                return Ok(());
            }

            println!("Found {} removable devices:", devices.len());
            println!(
                "\n  {:<12} {:<25} {:<10} {}",
                "DEVICE", "NAME", "SIZE", "LOCATION"
            );
            println!("  {:-<12} {:-<25} {:-<10} {:-<20}", "", "", "", "");
            for device in devices {
                let location = if device.is_mounted() {
                    device.mount_point.clone()
                } else {
                    "(Not mounted)".to_string()
                };
                println!(
                    "  {:<12} {:<25} {:>8.1} GB  {}",
                    device.path.display(),
                    device.name,
                    device.size_gb(),
                    location
                );
            }
        }
    }

    Ok(())
}
