//! Receiver CLI: binds a TCP listener and atomically commits incoming
//! camera frames under an output directory.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::instrument;

use camxfer::receiver::{self, ReceiverConfig};
use common::{OutputConfig, RunError, RuntimeConfig, Summary};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "camrecv",
    version,
    about = "Accept camera frames over TCP and commit them atomically to an output directory",
    long_about = "`camrecv` binds a TCP port, accepts connections from one or more `camsend` \
workers, and streams each incoming frame to a temporary file before atomically \
renaming it into place under out_dir.

EXAMPLE:
    camrecv /mnt/archive/cam01 --port 9000 --workers 16 --reuseport"
)]
struct Args {
    /// Output directory frames are committed under
    #[arg(value_name = "OUT_DIR")]
    out_dir: PathBuf,

    // Listener
    /// IP address to bind
    #[arg(long, default_value = "0.0.0.0", help_heading = "Listener")]
    listen_ip: IpAddr,

    /// TCP port to bind
    #[arg(long, help_heading = "Listener")]
    port: u16,

    /// Number of accept-loop tasks sharing the listen address
    #[arg(long, default_value_t = 16, help_heading = "Listener")]
    workers: usize,

    /// Enable SO_REUSEPORT explicitly (implied when workers > 1)
    #[arg(long, help_heading = "Listener")]
    reuseport: bool,

    // Protocol
    /// Receive chunk size, e.g. "8MiB"
    #[arg(long, default_value = "8MiB", value_name = "SIZE", help_heading = "Protocol")]
    chunk_bytes: bytesize::ByteSize,

    /// Per-chunk read/write timeout, e.g. "30s"
    #[arg(
        long,
        default_value = "30s",
        value_name = "DURATION",
        help_heading = "Protocol"
    )]
    io_timeout: String,

    /// Idle timeout waiting for the next frame on a connection, e.g. "60s"
    #[arg(
        long,
        default_value = "60s",
        value_name = "DURATION",
        help_heading = "Protocol"
    )]
    session_idle_timeout: String,

    /// Expect a leading `u32 file_count` on each connection and close the
    /// session after that many frames instead of running until EOF
    #[arg(long, help_heading = "Protocol")]
    expect_count_first: bool,

    /// Ignore a with-destination frame's `dest` field and always write
    /// under the frame's bare `name`, as if every frame used the legacy
    /// protocol
    #[arg(long, help_heading = "Protocol")]
    legacy_paths_only: bool,

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

/// Parse and validate everything a bad CLI invocation could get wrong,
/// synchronously, before the tokio runtime or any I/O starts, so a config
/// mistake always exits 1 and is never bucketed with a runtime I/O failure.
fn build_receiver_config(args: &Args) -> Result<ReceiverConfig> {
    let io_timeout = parse_duration_arg("--io-timeout", &args.io_timeout)?;
    let session_idle_timeout =
        parse_duration_arg("--session-idle-timeout", &args.session_idle_timeout)?;
    Ok(ReceiverConfig {
        listen_ip: args.listen_ip,
        port: args.port,
        out_dir: args.out_dir.clone(),
        workers: args.workers,
        reuseport: args.reuseport,
        chunk_bytes: args.chunk_bytes.0 as usize,
        io_timeout,
        session_idle_timeout,
        expect_count_first: args.expect_count_first,
        use_dest_paths: !args.legacy_paths_only,
    })
}

fn parse_duration_arg(flag: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw).with_context(|| format!("invalid {flag} {raw:?}"))
}

#[instrument(skip(config))]
async fn async_main(config: ReceiverConfig) -> Result<Summary, RunError> {
    receiver::run(config).await
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
    let receiver_config = match build_receiver_config(&args) {
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

    let json_stats = args.json_stats;
    let result = runtime.block_on(async move {
        tokio::select! {
            result = async_main(receiver_config) => result,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received interrupt, closing listener");
                Err(RunError::new(anyhow::anyhow!("interrupted"), Summary::default()))
            }
        }
    });

    match result {
        Ok(summary) => {
            print_summary(&summary, json_stats);
            if summary.files_failed > 0 {
                std::process::exit(2);
            }
            Ok(())
        }
        Err(err) => {
            print_summary(&err.summary, json_stats);
            if err.source.to_string() == "interrupted" {
                std::process::exit(130);
            }
            eprintln!("camrecv failed: {:#}", err.source);
            std::process::exit(2);
        }
    }
}
