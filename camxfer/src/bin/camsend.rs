//! Sender CLI: scans a camera source directory and streams ready files to
//! a `camrecv` endpoint over `conns` persistent TCP connections.

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::instrument;

use camxfer::sender::{self, SenderConfig};
use common::{OutputConfig, RunError, RuntimeConfig, Summary};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "camsend",
    version,
    about = "Stream camera frames from a source directory to a camrecv endpoint",
    long_about = "`camsend` watches a camera ring-buffer source directory, detects when each \
frame has finished being written, and streams it to a `camrecv` endpoint over \
one or more persistent TCP connections.

EXAMPLE:
    camsend /var/cam01/frames 10.0.0.5:9000 --dest-path /mnt/archive/cam01 --conns 4"
)]
struct Args {
    /// Source directory to scan for camera frames
    #[arg(value_name = "SRC_DIR")]
    src_dir: PathBuf,

    /// Destination endpoint, `host:port`
    #[arg(value_name = "HOST:PORT")]
    endpoint: String,

    // Scanner & readiness
    /// Glob filter applied to candidate file names
    #[arg(long, default_value = "*.jpg", help_heading = "Scanner & readiness")]
    pattern: String,

    /// Skip names lexicographically less than or equal to this marker
    #[arg(long, value_name = "NAME", help_heading = "Scanner & readiness")]
    start_after: Option<String>,

    /// Readiness lookahead: a later name this many positions ahead implies
    /// the candidate is closed by its writer
    #[arg(long, default_value_t = 4, help_heading = "Scanner & readiness")]
    lookahead: usize,

    /// Size-stability sampling interval in milliseconds
    #[arg(long, default_value_t = 5, value_name = "MS", help_heading = "Scanner & readiness")]
    stable_ms: u64,

    /// How long to wait for a candidate that has vanished by probe time
    #[arg(long, default_value_t = 10, value_name = "MS", help_heading = "Scanner & readiness")]
    file_wait_ms: u64,

    /// Directory poll interval in milliseconds
    #[arg(long, default_value_t = 50, value_name = "MS", help_heading = "Scanner & readiness")]
    poll_ms: u64,

    /// Exit after the backlog drains instead of scanning indefinitely
    #[arg(long, help_heading = "Scanner & readiness")]
    once: bool,

    /// In `--once` mode, how long the listing must stay unchanged before
    /// the remaining backlog is force-drained past the lookahead gate
    #[arg(
        long,
        default_value_t = 500,
        value_name = "MS",
        help_heading = "Scanner & readiness"
    )]
    drain_after_ms: u64,

    /// Stop after this many files have been transferred (0 = unlimited)
    #[arg(long, default_value_t = 0, help_heading = "Scanner & readiness")]
    max_files: u64,

    /// Delete stale `.part` files older than 60s in the source directory
    /// on startup (never touches files currently in flight)
    #[arg(long, help_heading = "Scanner & readiness")]
    cleanup_part_files: bool,

    // Workers & protocol
    /// Number of persistent TCP connections / worker tasks
    #[arg(long, default_value_t = 8, help_heading = "Workers & protocol")]
    conns: usize,

    /// Destination path prefix on the receiver
    #[arg(long, value_name = "PATH", help_heading = "Workers & protocol")]
    dest_path: String,

    /// Preserve the path relative to src_dir under dest_path instead of
    /// flattening to the basename
    #[arg(long, help_heading = "Workers & protocol")]
    preserve_structure: bool,

    /// Send chunk size, e.g. "8MiB"
    #[arg(
        long,
        default_value = "8MiB",
        value_name = "SIZE",
        help_heading = "Workers & protocol"
    )]
    chunk_bytes: bytesize::ByteSize,

    /// Maximum attempts per file before it is surfaced as a terminal failure
    #[arg(long, default_value_t = 5, help_heading = "Workers & protocol")]
    max_attempts: u32,

    /// TCP connect timeout, e.g. "5s"
    #[arg(
        long,
        default_value = "5s",
        value_name = "DURATION",
        help_heading = "Workers & protocol"
    )]
    connect_timeout: String,

    /// Per-chunk read/write timeout, e.g. "30s"
    #[arg(
        long,
        default_value = "30s",
        value_name = "DURATION",
        help_heading = "Workers & protocol"
    )]
    io_timeout: String,

    /// Grace period given to in-flight workers to finish their current
    /// file after a cancellation signal before the process exits
    #[arg(
        long,
        default_value = "10s",
        value_name = "DURATION",
        help_heading = "Workers & protocol"
    )]
    shutdown_grace: String,

    // Output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: WARN)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Quiet mode, suppress all but error-level logs
    #[arg(short = 'q', long, help_heading = "Output")]
    quiet: bool,

    /// Emit the final summary as JSON on stdout
    #[arg(long, help_heading = "Output")]
    json_stats: bool,

    // Advanced settings
    /// Number of tokio worker threads (0 = number of CPU cores)
    #[arg(long, default_value_t = 0, value_name = "N", help_heading = "Advanced settings")]
    max_workers: usize,

    /// Number of tokio blocking threads (0 = tokio default of 512)
    #[arg(
        long,
        default_value_t = 0,
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

fn resolve_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .with_context(|| format!("endpoint {endpoint:?} must be HOST:PORT"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in endpoint {endpoint:?}"))?;
    // Fail fast on an unresolvable host instead of deferring to the first
    // connect attempt deep inside the worker loop.
    let _ = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve host {host:?}"))?;
    Ok((host.to_string(), port))
}

/// Parse and validate everything a bad CLI invocation could get wrong,
/// synchronously, before the tokio runtime or any I/O starts. Keeping this
/// separate from `async_main` means a config mistake always exits 1, never
/// gets bucketed with a runtime I/O failure (exit 2).
fn build_sender_config(args: &Args) -> Result<SenderConfig> {
    let (host, port) = resolve_endpoint(&args.endpoint)?;
    let connect_timeout = humantime::parse_duration(&args.connect_timeout)
        .with_context(|| format!("invalid --connect-timeout {:?}", args.connect_timeout))?;
    let io_timeout = humantime::parse_duration(&args.io_timeout)
        .with_context(|| format!("invalid --io-timeout {:?}", args.io_timeout))?;
    Ok(SenderConfig {
        src_dir: args.src_dir.clone(),
        host,
        port,
        pattern: args.pattern.clone(),
        start_after: args.start_after.clone(),
        conns: args.conns,
        lookahead: args.lookahead,
        stable_ms: args.stable_ms,
        file_wait_ms: args.file_wait_ms,
        max_files: args.max_files,
        dest_path: args.dest_path.clone(),
        preserve_structure: args.preserve_structure,
        cleanup_part_files: args.cleanup_part_files,
        once: args.once,
        chunk_bytes: args.chunk_bytes.0 as usize,
        poll_ms: args.poll_ms,
        drain_after_ms: args.drain_after_ms,
        connect_timeout,
        io_timeout,
        max_attempts: args.max_attempts,
    })
}

#[instrument(skip(config, shutdown))]
async fn async_main(config: SenderConfig, shutdown: Arc<AtomicBool>) -> Result<Summary, RunError> {
    sender::run_with_shutdown(config, shutdown).await
}

fn print_summary(summary: &Summary, json: bool) {
    if json {
        match serde_json::to_string(summary) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("failed to serialize summary: {err}"),
        }
    } else {
        println!("{summary}");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.dest_path.is_empty() {
        eprintln!("error: --dest-path must be non-empty");
        std::process::exit(1);
    }
    let shutdown_grace: Duration = match humantime::parse_duration(&args.shutdown_grace) {
        Ok(duration) => duration,
        Err(err) => {
            eprintln!("error: invalid --shutdown-grace {:?}: {err}", args.shutdown_grace);
            std::process::exit(1);
        }
    };
    let sender_config = match build_sender_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    };

    let output = OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        json_stats: args.json_stats,
    };
    common::logging::init(&output);
    let runtime_config = RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let runtime = common::runtime::build(&runtime_config).context("failed to start runtime")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let result = runtime.block_on(async {
        let shutdown_for_signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("received interrupt, draining in-flight transfers");
                shutdown_for_signal.store(true, Ordering::SeqCst);
                tokio::time::sleep(shutdown_grace).await;
                tracing::error!("grace period elapsed, forcing exit");
                std::process::exit(130);
            }
        });
        async_main(sender_config, shutdown.clone()).await
    });

    match result {
        Ok(summary) => {
            print_summary(&summary, args.json_stats);
            if summary.files_failed > 0 {
                std::process::exit(2);
            }
            Ok(())
        }
        Err(err) => {
            print_summary(&err.summary, args.json_stats);
            eprintln!("camsend failed: {:#}", err.source);
            if shutdown.load(Ordering::SeqCst) {
                std::process::exit(130);
            }
            std::process::exit(2);
        }
    }
}
