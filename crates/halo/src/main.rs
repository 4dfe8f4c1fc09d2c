//! halo: apply a convolution filter to a raw pixel buffer.
//!
//! The image is a headerless, row-major byte buffer whose shape is given
//! on the command line; the filter is a whitespace-separated text
//! matrix. The result has the same shape as the input and goes to
//! `--output`, or stdout when that is omitted.
//!
//! # Usage
//!
//! ```text
//! halo serial -d in.raw -m blur.txt -x 640 -y 480 -s 3 -o out.raw
//! halo local --workers 4 -d in.raw -m blur.txt -x 640 -y 480 > out.raw
//! halo leader --listen 0.0.0.0:7400 --workers 3 -d in.raw -m blur.txt -x 640 -y 480 -o out.raw
//! halo worker --connect leader-host:7400
//! ```
//!
//! Logs go to stderr. Set `RUST_LOG` to override the level chosen by
//! `--verbose`.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::error::Error;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use halo_cluster::{LeaderJob, LeaderListener, Role, RunReport, TcpCommunicator};
use halo_pipeline::diagnostics::{RunDiagnostics, StageMetrics};
use halo_pipeline::{Dimensions, FilterMatrix, PixelBuffer, RunConfig, convolve_until_stable};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

type AppResult<T> = Result<T, Box<dyn Error>>;

/// Convolve a raw pixel buffer with a text filter, in one process or
/// across a leader/worker pool.
#[derive(Parser)]
#[command(name = "halo", version)]
struct Cli {
    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the run report as JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convolve in this process, optionally re-filtering until stable.
    Serial {
        #[command(flatten)]
        image: ImageArgs,

        /// Upper bound on convolution passes.
        #[arg(long, default_value_t = RunConfig::DEFAULT_MAX_ITERATIONS)]
        max_iterations: u32,

        /// Stop re-filtering once successive images are this close.
        #[arg(long, default_value_t = RunConfig::DEFAULT_CONVERGENCE_THRESHOLD)]
        convergence_threshold: f64,

        /// JSON run configuration (overrides the individual flags).
        #[arg(long)]
        config_json: Option<String>,
    },

    /// Run a leader and N worker threads in this process.
    Local {
        #[command(flatten)]
        image: ImageArgs,

        /// Number of workers.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        workers: u32,
    },

    /// Accept N TCP workers, then distribute the image across them.
    Leader {
        #[command(flatten)]
        image: ImageArgs,

        /// Address to listen on.
        #[arg(long, value_name = "ADDR")]
        listen: String,

        /// Number of workers to wait for.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        workers: u32,
    },

    /// Join a TCP leader and compute whatever band it assigns.
    Worker {
        /// Leader address.
        #[arg(long, value_name = "ADDR")]
        connect: String,
    },
}

/// Inputs and outputs shared by every leader-side subcommand.
#[derive(Args)]
struct ImageArgs {
    /// Raw input image.
    #[arg(short = 'd', long = "input", value_name = "PATH")]
    input: PathBuf,

    /// Raw output image (stdout when omitted).
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Filter matrix text file.
    #[arg(short = 'm', long, value_name = "PATH")]
    filter: PathBuf,

    /// Image width in pixels.
    #[arg(short = 'x', long)]
    width: u32,

    /// Image height in pixels.
    #[arg(short = 'y', long)]
    height: u32,

    /// Bytes per pixel.
    #[arg(short = 's', long, default_value_t = 1)]
    channels: u32,

    /// Also write the result as a PNG (1 to 4 channels only).
    #[arg(long, value_name = "PATH")]
    preview: Option<PathBuf>,
}

impl ImageArgs {
    const fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height, self.channels)
    }

    fn leader_job(&self) -> AppResult<LeaderJob<'static>> {
        Ok(LeaderJob {
            dimensions: self.dimensions(),
            image: Box::new(BufReader::new(open(&self.input)?)),
            filter: Box::new(BufReader::new(open(&self.filter)?)),
            output: self.output_sink()?,
        })
    }

    fn output_sink(&self) -> AppResult<Box<dyn Write>> {
        Ok(match &self.output {
            Some(path) => Box::new(BufWriter::new(
                File::create(path).map_err(|e| format!("cannot create {}: {e}", path.display()))?,
            )),
            None => Box::new(BufWriter::new(io::stdout().lock())),
        })
    }
}

fn open(path: &Path) -> AppResult<File> {
    Ok(File::open(path).map_err(|e| format!("cannot open {}: {e}", path.display()))?)
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

/// Build a [`RunConfig`] from the serial flags, or from `--config-json`
/// when given.
fn config_from_flags(
    max_iterations: u32,
    convergence_threshold: f64,
    config_json: Option<&str>,
) -> AppResult<RunConfig> {
    if let Some(json) = config_json {
        return Ok(serde_json::from_str(json)
            .map_err(|e| format!("error parsing --config-json: {e}"))?);
    }
    Ok(RunConfig {
        max_iterations,
        convergence_threshold,
    })
}

fn run_serial(image_args: &ImageArgs, config: &RunConfig) -> AppResult<(PixelBuffer, RunDiagnostics)> {
    let mut diagnostics = RunDiagnostics::default();
    let run_started = Instant::now();

    let started = Instant::now();
    let dimensions = image_args.dimensions();
    dimensions.validate()?;
    let image = PixelBuffer::read_from(BufReader::new(open(&image_args.input)?), dimensions)?;
    let filter = FilterMatrix::parse_from_text(BufReader::new(open(&image_args.filter)?))?;
    let radius = filter.kernel_radius()?;
    diagnostics.summary.dimensions = Some(dimensions);
    diagnostics.summary.filter_radius = Some(radius);
    diagnostics.record(
        "ParsingInputs",
        started.elapsed(),
        StageMetrics::Parse {
            dimensions,
            filter_width: filter.width(),
            filter_height: filter.height(),
        },
    );

    let started = Instant::now();
    let (output, report) = convolve_until_stable(&image, &filter, config)?;
    diagnostics.record(
        "Computing",
        started.elapsed(),
        StageMetrics::Converge {
            iterations: report.iterations,
            final_distance: report.final_distance,
        },
    );
    info!(
        iterations = report.iterations,
        distance = report.final_distance,
        "convolution finished"
    );

    let started = Instant::now();
    let mut sink = image_args.output_sink()?;
    output.encode_to_bytes(&mut sink)?;
    sink.flush()?;
    diagnostics.record(
        "WriteOutput",
        started.elapsed(),
        StageMetrics::Write {
            bytes: output.as_bytes().len() as u64,
        },
    );

    diagnostics.total_duration = run_started.elapsed();
    Ok((output, diagnostics))
}

fn run_leader(image_args: &ImageArgs, listen: &str, workers: u32) -> AppResult<RunReport> {
    let listener = LeaderListener::bind(listen)?;
    info!(addr = %listener.local_addr()?, workers, "waiting for workers");
    let mut comm = listener.accept_workers(workers as usize)?;
    Ok(halo_cluster::run(
        Role::Leader(image_args.leader_job()?),
        &mut comm,
    )?)
}

fn run_worker(connect: &str) -> AppResult<RunReport> {
    let mut comm = TcpCommunicator::connect(connect)?;
    Ok(halo_cluster::run(Role::Worker, &mut comm)?)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn write_preview(path: &Path, output: &PixelBuffer) -> AppResult<()> {
    let png = halo_pipeline::preview::encode_png(output)?;
    std::fs::write(path, &png).map_err(|e| format!("cannot write {}: {e}", path.display()))?;
    info!(path = %path.display(), bytes = png.len(), "preview written");
    Ok(())
}

/// Print the run report. Stdout is reserved for image bytes when no
/// `--output` was given, so the report goes to stderr in that case.
fn print_report(diagnostics: &RunDiagnostics, json: bool, to_stderr: bool) -> AppResult<()> {
    let text = if json {
        serde_json::to_string_pretty(diagnostics)?
    } else {
        diagnostics.report()
    };
    if to_stderr {
        eprintln!("{text}");
    } else {
        println!("{text}");
    }
    Ok(())
}

fn execute(cli: &Cli) -> AppResult<()> {
    match &cli.command {
        Command::Serial {
            image,
            max_iterations,
            convergence_threshold,
            config_json,
        } => {
            let config =
                config_from_flags(*max_iterations, *convergence_threshold, config_json.as_deref())?;
            let (output, diagnostics) = run_serial(image, &config)?;
            if let Some(path) = &image.preview {
                write_preview(path, &output)?;
            }
            print_report(&diagnostics, cli.json, image.output.is_none())
        }
        Command::Local { image, workers } => {
            let run = halo_cluster::run_local(image.leader_job()?, *workers as usize)?;
            if let (Some(path), Some(output)) = (&image.preview, &run.leader.output) {
                write_preview(path, output)?;
            }
            print_report(&run.leader.diagnostics, cli.json, image.output.is_none())
        }
        Command::Leader {
            image,
            listen,
            workers,
        } => {
            let report = run_leader(image, listen, *workers)?;
            if let (Some(path), Some(output)) = (&image.preview, &report.output) {
                write_preview(path, output)?;
            }
            print_report(&report.diagnostics, cli.json, image.output.is_none())
        }
        Command::Worker { connect } => {
            let report = run_worker(connect)?;
            print_report(&report.diagnostics, cli.json, false)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    match execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
