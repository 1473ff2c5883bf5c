//! Dispatcher and worker pool: drains ready files from the scanner /
//! readiness probe over a bounded work queue and streams them to the
//! receiver over `conns` persistent TCP connections.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, instrument, warn};

use crate::readiness::{self, ReadinessConfig};
use crate::scanner::{Scanner, ScannerConfig};
use common::{FileError, RunError, Summary};

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub src_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub pattern: String,
    pub start_after: Option<String>,
    pub conns: usize,
    pub lookahead: usize,
    pub stable_ms: u64,
    pub file_wait_ms: u64,
    pub max_files: u64,
    pub dest_path: String,
    pub preserve_structure: bool,
    pub cleanup_part_files: bool,
    pub once: bool,
    pub chunk_bytes: usize,
    pub poll_ms: u64,
    pub drain_after_ms: u64,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            src_dir: PathBuf::new(),
            host: String::new(),
            port: 0,
            pattern: "*.jpg".to_string(),
            start_after: None,
            conns: 8,
            lookahead: 4,
            stable_ms: 5,
            file_wait_ms: 10,
            max_files: 0,
            dest_path: String::new(),
            preserve_structure: false,
            cleanup_part_files: false,
            once: false,
            chunk_bytes: 8 * 1024 * 1024,
            poll_ms: 50,
            drain_after_ms: 500,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
struct TransferTask {
    name: String,
    attempts: u32,
}

enum TaskOutcome {
    Success { name: String, bytes: u64 },
    TerminalFailure { name: String, error: String, attempts: u32 },
}

fn destination_for(name: &str, config: &SenderConfig) -> String {
    let prefix = config.dest_path.trim_end_matches('/');
    if config.preserve_structure {
        format!("{prefix}/{name}")
    } else {
        let basename = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        format!("{prefix}/{basename}")
    }
}

/// Run the sender end to end: scan, probe readiness, dispatch, stream.
/// Returns the run summary on success, or `RunError` carrying whatever
/// partial summary had accumulated before a fatal error.
pub async fn run(config: SenderConfig) -> Result<Summary, RunError> {
    run_with_shutdown(config, Arc::new(AtomicBool::new(false))).await
}

/// Same as [`run`], but `shutdown` is shared with the caller: flipping it
/// (e.g. from a SIGINT handler) stops the scanner from dispatching new
/// tasks, and in-flight workers finish their current file before exiting.
pub async fn run_with_shutdown(
    config: SenderConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<Summary, RunError> {
    let start = tokio::time::Instant::now();
    let scanner_config = ScannerConfig::new(
        config.src_dir.clone(),
        &config.pattern,
        config.start_after.clone(),
    )
    .map_err(|err| RunError::new(err, Summary::default()))?;

    let (task_tx, task_rx) = mpsc::channel::<TransferTask>(config.conns * 4 + 1);
    let task_rx = Arc::new(Mutex::new(task_rx));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<TaskOutcome>();

    let mut worker_handles = Vec::new();
    for worker_id in 0..config.conns {
        let config = config.clone();
        let task_rx = task_rx.clone();
        let task_tx = task_tx.clone();
        let result_tx = result_tx.clone();
        let shutdown = shutdown.clone();
        worker_handles.push(tokio::spawn(async move {
            worker_loop(worker_id, config, task_rx, task_tx, result_tx, shutdown).await;
        }));
    }
    drop(result_tx);

    let scan_config = config.clone();
    let dispatch_shutdown = shutdown.clone();
    let scan_handle = tokio::spawn(async move {
        scan_and_dispatch(scan_config, scanner_config, task_tx, dispatch_shutdown).await
    });

    let aggregator = tokio::spawn(async move {
        let mut summary = Summary::default();
        while let Some(outcome) = result_rx.recv().await {
            match outcome {
                TaskOutcome::Success { bytes, .. } => {
                    summary.files_sent += 1;
                    summary.bytes_sent += bytes;
                }
                TaskOutcome::TerminalFailure {
                    name,
                    error,
                    attempts,
                } => {
                    summary.files_failed += 1;
                    summary.per_file_errors.push(FileError {
                        name,
                        error,
                        attempts,
                    });
                }
            }
        }
        summary
    });

    let scan_result = scan_handle.await;
    shutdown.store(true, Ordering::SeqCst);
    for handle in worker_handles {
        let _ = handle.await;
    }
    let mut summary = aggregator.await.unwrap_or_default();
    summary.elapsed = start.elapsed();

    match scan_result {
        Ok(Ok(())) => Ok(summary),
        Ok(Err(err)) => Err(RunError::new(err, summary)),
        Err(join_err) => Err(RunError::new(anyhow::anyhow!(join_err), summary)),
    }
}

#[instrument(skip(config, scanner_config, task_tx, shutdown))]
async fn scan_and_dispatch(
    config: SenderConfig,
    scanner_config: ScannerConfig,
    task_tx: mpsc::Sender<TransferTask>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut scanner = Scanner::new();
    let mut pending: VecDeque<String> = VecDeque::new();
    let readiness_config = ReadinessConfig {
        lookahead: config.lookahead,
        stable_ms: config.stable_ms,
        file_wait_ms: config.file_wait_ms,
    };
    let mut last_listing_len = 0usize;
    let mut last_change_at = tokio::time::Instant::now();
    let mut dispatched = 0u64;

    if config.cleanup_part_files {
        let _ = crate::scanner::cleanup_stale_part_files(
            &config.src_dir,
            &scanner,
            Duration::from_secs(60),
        )
        .await;
    }

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        if config.max_files > 0 && dispatched >= config.max_files {
            return Ok(());
        }
        let new_candidates = scanner.poll(&scanner_config).await?;
        for name in new_candidates {
            pending.push_back(name);
        }

        let mut listing = list_current_names(&config.src_dir, &scanner_config).await?;
        listing.sort();
        if listing.len() != last_listing_len {
            last_listing_len = listing.len();
            last_change_at = tokio::time::Instant::now();
        }
        let draining = config.once
            && !pending.is_empty()
            && last_change_at.elapsed() >= Duration::from_millis(config.drain_after_ms);

        let mut still_pending = VecDeque::new();
        while let Some(name) = pending.pop_front() {
            let effective_readiness = if draining {
                ReadinessConfig {
                    lookahead: 0,
                    ..readiness_config
                }
            } else {
                readiness_config
            };
            let outcome = readiness::probe(
                &config.src_dir,
                &name,
                &listing,
                &effective_readiness,
            )
            .await;
            match outcome {
                readiness::Outcome::Ready => {
                    if task_tx
                        .send(TransferTask {
                            name: name.clone(),
                            attempts: 0,
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                    dispatched += 1;
                    debug!(%name, "dispatched");
                    if config.max_files > 0 && dispatched >= config.max_files {
                        break;
                    }
                }
                readiness::Outcome::FileMissing => {
                    warn!(%name, "file_missing: skipped after wait");
                    scanner.mark_failed_terminal(&name);
                }
                readiness::Outcome::NotYetLookahead | readiness::Outcome::NotStable => {
                    still_pending.push_back(name);
                }
            }
        }
        still_pending.extend(pending);
        pending = still_pending;

        if config.once && pending.is_empty() {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(config.poll_ms)).await;
    }
}

async fn list_current_names(dir: &Path, scanner_config: &ScannerConfig) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to open source directory {dir:?}"))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed reading source directory {dir:?}"))?
    {
        if let Some(name) = entry.file_name().to_str() {
            if scanner_config.pattern.is_match(name) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

#[instrument(skip(config, task_rx, task_tx, result_tx, shutdown))]
async fn worker_loop(
    worker_id: usize,
    config: SenderConfig,
    task_rx: Arc<Mutex<mpsc::Receiver<TransferTask>>>,
    task_tx: mpsc::Sender<TransferTask>,
    result_tx: mpsc::UnboundedSender<TaskOutcome>,
    shutdown: Arc<AtomicBool>,
) {
    let mut connection: Option<TcpStream> = None;
    let mut backoff = common::backoff::Backoff::new(Duration::from_millis(100), Duration::from_secs(5));

    loop {
        let task = loop {
            let mut rx = task_rx.lock().await;
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(task)) => break Some(task),
                Ok(None) => break None,
                Err(_elapsed) => {
                    drop(rx);
                    if shutdown.load(Ordering::SeqCst) {
                        break None;
                    }
                    continue;
                }
            }
        };
        let Some(mut task) = task else {
            return;
        };

        if connection.is_none() {
            match connect(&config).await {
                Ok(stream) => {
                    backoff.reset();
                    debug!(worker_id, "connected");
                    connection = Some(stream);
                }
                Err(err) => {
                    task.attempts += 1;
                    handle_task_failure(worker_id, &config, task, err, &task_tx, &result_tx, &mut backoff)
                        .await;
                    continue;
                }
            }
        }

        let path = config.src_dir.join(&task.name);
        let dest = destination_for(&task.name, &config);
        let send_result = {
            let stream = connection.as_mut().expect("connection established above");
            send_one_file(stream, &task.name, &dest, &path, config.chunk_bytes, config.io_timeout)
                .await
        };
        match send_result {
            Ok(bytes) => {
                let _ = result_tx.send(TaskOutcome::Success {
                    name: task.name.clone(),
                    bytes,
                });
            }
            Err(err) => {
                connection = None;
                task.attempts += 1;
                handle_task_failure(worker_id, &config, task, err, &task_tx, &result_tx, &mut backoff)
                    .await;
            }
        }
    }
}

/// Surfaces a task's failure as a retry (re-enqueued after the worker's
/// shared backoff delay) or a terminal failure once `max_attempts` is
/// reached. The same `Backoff` instance is used whether the failure came
/// from `connect()` or from a mid-transfer write, so a worker never sleeps
/// twice for one failure and never exceeds the configured backoff cap.
async fn handle_task_failure(
    worker_id: usize,
    config: &SenderConfig,
    task: TransferTask,
    err: anyhow::Error,
    task_tx: &mpsc::Sender<TransferTask>,
    result_tx: &mpsc::UnboundedSender<TaskOutcome>,
    backoff: &mut common::backoff::Backoff,
) {
    if task.attempts >= config.max_attempts {
        warn!(worker_id, name = %task.name, attempts = task.attempts, error = %err, "giving up after max attempts");
        let _ = result_tx.send(TaskOutcome::TerminalFailure {
            name: task.name,
            error: err.to_string(),
            attempts: task.attempts,
        });
        return;
    }
    let delay = backoff.next_delay();
    warn!(worker_id, name = %task.name, attempts = task.attempts, error = %err, delay_ms = delay.as_millis() as u64, "retrying after backoff");
    tokio::time::sleep(delay).await;
    let _ = task_tx.send(task).await;
}

async fn connect(config: &SenderConfig) -> Result<TcpStream> {
    let addr = format!("{}:{}", config.host, config.port);
    match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(err)) => Err(anyhow::Error::new(err).context(format!("failed to connect to {addr}"))),
        Err(_) => Err(anyhow::anyhow!("connect to {addr} timed out")),
    }
}

async fn send_one_file(
    stream: &mut TcpStream,
    name: &str,
    dest: &str,
    path: &Path,
    chunk_bytes: usize,
    io_timeout: Duration,
) -> Result<u64> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {path:?} for sending"))?;
    let payload_len = file
        .metadata()
        .await
        .with_context(|| format!("failed to stat {path:?}"))?
        .len();
    tokio::time::timeout(
        io_timeout,
        protocol::frame::write_header(stream, protocol::ProtocolTag::WithDest, name, Some(dest), payload_len),
    )
    .await
    .context("timed out writing frame header")?
    .context("failed writing frame header")?;

    let mut remaining = payload_len;
    let mut buf = vec![0u8; chunk_bytes];
    while remaining > 0 {
        let want = remaining.min(chunk_bytes as u64) as usize;
        let read = tokio::time::timeout(io_timeout, file.read(&mut buf[..want]))
            .await
            .context("timed out reading source file")?
            .with_context(|| format!("failed reading {path:?}"))?;
        if read == 0 {
            anyhow::bail!("{path:?} ended early, {remaining} bytes unaccounted for");
        }
        tokio::time::timeout(io_timeout, stream.write_all(&buf[..read]))
            .await
            .context("timed out writing payload chunk")?
            .context("failed writing payload chunk")?;
        remaining -= read as u64;
    }
    tokio::time::timeout(io_timeout, stream.flush())
        .await
        .context("timed out flushing connection")?
        .context("failed flushing connection")?;
    Ok(payload_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_preserving_structure_joins_prefix_and_name() {
        let config = SenderConfig {
            dest_path: "/out/".to_string(),
            preserve_structure: true,
            ..SenderConfig::default()
        };
        assert_eq!(destination_for("a_001.jpg", &config), "/out/a_001.jpg");
    }

    #[test]
    fn destination_without_structure_uses_basename_only() {
        let config = SenderConfig {
            dest_path: "/out".to_string(),
            preserve_structure: false,
            ..SenderConfig::default()
        };
        assert_eq!(destination_for("a_001.jpg", &config), "/out/a_001.jpg");
    }
}
