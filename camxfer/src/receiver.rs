//! Listener + ReceiveWorker: accepts TCP connections and streams each
//! incoming frame to a temporary file before atomically renaming it into
//! place. Each connection reads a header, copies a known-length payload,
//! and reports completion back to an aggregator; payloads always land on a
//! temp path first so a truncated stream never becomes visible at its
//! final path.

use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use common::{FileError, RunError, Summary};
use protocol::frame::{read_frame_count, read_header, FrameError};
use protocol::path_safety::safe_join;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub listen_ip: IpAddr,
    pub port: u16,
    pub out_dir: PathBuf,
    /// Number of accept-loop tasks binding the listen address. Values above
    /// 1 imply `SO_REUSEPORT` regardless of `reuseport`, since the kernel
    /// cannot otherwise hand out the same address to more than one socket.
    pub workers: usize,
    pub reuseport: bool,
    pub chunk_bytes: usize,
    pub io_timeout: Duration,
    /// How long a connection may sit idle waiting for the next frame
    /// header (or, with `expect_count_first`, the leading count) before
    /// it is closed.
    pub session_idle_timeout: Duration,
    /// Count-first variant: each connection begins with a `u32 file_count`,
    /// and the worker loops exactly that many times instead of running
    /// until the peer closes the socket.
    pub expect_count_first: bool,
    /// Honor a with-destination frame's `dest` field. When false, every
    /// frame is written under `header.name` even if the sender used the
    /// with-destination protocol, as if the dest field were absent.
    pub use_dest_paths: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            out_dir: PathBuf::new(),
            workers: 16,
            reuseport: false,
            chunk_bytes: 8 * 1024 * 1024,
            io_timeout: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(60),
            expect_count_first: false,
            use_dest_paths: true,
        }
    }
}

enum ConnOutcome {
    Completed { name: String, bytes: u64 },
    Failed { name: String, error: String },
}

/// Run the receiver end to end: bind `workers` accept loops, spawn one task
/// per accepted connection, and fold their outcomes into a `Summary`. Runs
/// until the listeners are dropped or an accept loop returns a fatal error;
/// callers that want graceful shutdown on a signal should wrap this in a
/// `tokio::select!` against a cancellation future at the call site.
pub async fn run(config: ReceiverConfig) -> Result<Summary, RunError> {
    let start = tokio::time::Instant::now();
    tokio::fs::create_dir_all(&config.out_dir)
        .await
        .with_context(|| format!("failed to create output directory {:?}", config.out_dir))
        .map_err(|err| RunError::new(err, Summary::default()))?;

    let addr = SocketAddr::new(config.listen_ip, config.port);
    let share_port = config.reuseport || config.workers > 1;
    let worker_count = config.workers.max(1);
    let mut listeners = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let listener = protocol::listener::bind(addr, share_port)
            .map_err(|err| RunError::new(err, Summary::default()))?;
        listeners.push(listener);
    }

    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<ConnOutcome>();
    let nonce = Arc::new(AtomicU64::new(0));
    let mut accept_handles = Vec::with_capacity(listeners.len());
    for (worker_id, listener) in listeners.into_iter().enumerate() {
        let config = config.clone();
        let outcome_tx = outcome_tx.clone();
        let nonce = Arc::clone(&nonce);
        accept_handles.push(tokio::spawn(async move {
            accept_loop(worker_id, listener, config, outcome_tx, nonce).await
        }));
    }
    drop(outcome_tx);

    let aggregator = tokio::spawn(async move {
        let mut summary = Summary::default();
        while let Some(outcome) = outcome_rx.recv().await {
            match outcome {
                ConnOutcome::Completed { bytes, .. } => {
                    summary.files_sent += 1;
                    summary.bytes_sent += bytes;
                }
                ConnOutcome::Failed { name, error } => {
                    summary.files_failed += 1;
                    summary.per_file_errors.push(FileError {
                        name,
                        error,
                        attempts: 1,
                    });
                }
            }
        }
        summary
    });

    let mut first_err = None;
    for handle in accept_handles {
        if let Err(err) = handle.await {
            if first_err.is_none() {
                first_err = Some(anyhow::anyhow!(err));
            }
        }
    }

    let mut summary = aggregator.await.unwrap_or_default();
    summary.elapsed = start.elapsed();
    match first_err {
        Some(err) => Err(RunError::new(err, summary)),
        None => Ok(summary),
    }
}

/// One accept loop never returns on a clean peer disconnect; it only
/// returns once the listener itself errors out (e.g. the socket is closed),
/// which `run` treats as fatal for the whole receiver.
#[instrument(skip(listener, config, outcome_tx, nonce))]
async fn accept_loop(
    worker_id: usize,
    listener: TcpListener,
    config: ReceiverConfig,
    outcome_tx: mpsc::UnboundedSender<ConnOutcome>,
    nonce: Arc<AtomicU64>,
) -> Result<()> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .with_context(|| format!("listener worker {worker_id} failed to accept"))?;
        let _ = stream.set_nodelay(true);
        debug!(%peer, worker_id, "accepted connection");
        let config = config.clone();
        let outcome_tx = outcome_tx.clone();
        let nonce = Arc::clone(&nonce);
        tokio::spawn(async move {
            handle_connection(worker_id, stream, config, outcome_tx, nonce).await;
        });
    }
}

/// Serves one connection until the peer closes it cleanly, the
/// count-first budget is exhausted, or a frame fails to parse or commit;
/// a single connection is single-tasked for its whole lifetime, so frames
/// on it are handled strictly in order.
async fn handle_connection(
    worker_id: usize,
    mut stream: tokio::net::TcpStream,
    config: ReceiverConfig,
    outcome_tx: mpsc::UnboundedSender<ConnOutcome>,
    nonce: Arc<AtomicU64>,
) {
    let mut remaining = if config.expect_count_first {
        match tokio::time::timeout(config.session_idle_timeout, read_frame_count(&mut stream))
            .await
        {
            Ok(Ok(Some(count))) => Some(count),
            Ok(Ok(None)) => return,
            Ok(Err(err)) => {
                warn!(error = %err, "malformed file count, closing connection");
                return;
            }
            Err(_) => {
                warn!("session idle timeout waiting for file count");
                return;
            }
        }
    } else {
        None
    };

    loop {
        if remaining == Some(0) {
            return;
        }
        let header = match tokio::time::timeout(config.session_idle_timeout, read_header(&mut stream))
            .await
        {
            Ok(Ok(header)) => header,
            Ok(Err(FrameError::Eof)) => return,
            Ok(Err(err)) => {
                warn!(error = %err, "malformed frame, closing connection");
                return;
            }
            Err(_) => {
                warn!("session idle timeout waiting for next frame");
                return;
            }
        };
        let relative = if config.use_dest_paths {
            header.dest.as_deref().unwrap_or(&header.name)
        } else {
            header.name.as_str()
        };
        let outcome =
            receive_one_file(worker_id, &mut stream, relative, &header, &config, &nonce).await;
        match outcome {
            Ok(bytes) => {
                let _ = outcome_tx.send(ConnOutcome::Completed {
                    name: header.name.clone(),
                    bytes,
                });
            }
            Err(err) => {
                warn!(name = %header.name, error = %err, "transfer failed, connection closing");
                let _ = outcome_tx.send(ConnOutcome::Failed {
                    name: header.name.clone(),
                    error: err.to_string(),
                });
                return;
            }
        }
        if let Some(count) = remaining.as_mut() {
            *count -= 1;
        }
    }
}

/// Streams one payload to a temp file next to its final path, then
/// atomically renames it into place. On any error the temp file is removed
/// and no bytes are left visible at the final path.
async fn receive_one_file(
    worker_id: usize,
    stream: &mut tokio::net::TcpStream,
    relative: &str,
    header: &protocol::frame::FrameHeader,
    config: &ReceiverConfig,
    nonce: &AtomicU64,
) -> Result<u64> {
    let final_path =
        safe_join(&config.out_dir, relative).context("rejected unsafe destination path")?;
    let parent = final_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.out_dir.clone());
    tokio::fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("failed to create destination directory {parent:?}"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tokio::fs::set_permissions(&parent, std::fs::Permissions::from_mode(0o755)).await;
    }

    let basename = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let id = nonce.fetch_add(1, Ordering::Relaxed);
    let temp_path = parent.join(format!(".{basename}.part.{worker_id}.{id}"));

    let result = stream_payload(stream, &temp_path, header.payload_len, config).await;
    match result {
        Ok(()) => {
            tokio::fs::rename(&temp_path, &final_path)
                .await
                .with_context(|| format!("failed to commit {final_path:?}"))?;
            Ok(header.payload_len)
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}

async fn stream_payload(
    stream: &mut tokio::net::TcpStream,
    temp_path: &Path,
    payload_len: u64,
    config: &ReceiverConfig,
) -> Result<()> {
    let mut file = tokio::fs::File::create(temp_path)
        .await
        .with_context(|| format!("failed to create temp file {temp_path:?}"))?;
    let mut remaining = payload_len;
    let mut buf = vec![0u8; config.chunk_bytes];
    while remaining > 0 {
        let want = remaining.min(config.chunk_bytes as u64) as usize;
        let read = tokio::time::timeout(config.io_timeout, stream.read(&mut buf[..want]))
            .await
            .context("timed out reading payload chunk")?
            .context("failed reading payload chunk")?;
        if read == 0 {
            anyhow::bail!("connection closed with {remaining} bytes left in payload");
        }
        tokio::time::timeout(config.io_timeout, file.write_all(&buf[..read]))
            .await
            .context("timed out writing temp file")?
            .context("failed writing temp file")?;
        remaining -= read as u64;
    }
    file.flush().await.context("failed flushing temp file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::frame::write_header;
    use protocol::ProtocolTag;
    use tokio::net::TcpStream;

    async fn send_frame(addr: SocketAddr, tag: ProtocolTag, name: &str, dest: Option<&str>, payload: &[u8]) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_header(&mut stream, tag, name, dest, payload.len() as u64)
            .await
            .unwrap();
        stream.write_all(payload).await.unwrap();
        stream.flush().await.unwrap();
    }

    #[tokio::test]
    async fn receives_a_legacy_frame_to_its_final_path() {
        let out_dir = tempfile::tempdir().unwrap();
        let config = ReceiverConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            out_dir: out_dir.path().to_path_buf(),
            workers: 1,
            ..ReceiverConfig::default()
        };
        let addr = SocketAddr::new(config.listen_ip, config.port);
        let listener = protocol::listener::bind(addr, false).unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let server_config = ReceiverConfig {
            port: bound.port(),
            ..config
        };
        let handle = tokio::spawn(run(server_config));
        // give the accept loop a moment to bind and start listening
        tokio::time::sleep(Duration::from_millis(50)).await;

        send_frame(bound, ProtocolTag::Legacy, "a.jpg", None, b"hello world").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let final_path = out_dir.path().join("a.jpg");
        let contents = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(contents, b"hello world");
        let leftovers: Vec<_> = std::fs::read_dir(out_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".part."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn rejects_a_path_traversal_attempt_without_writing_outside_out_dir() {
        let out_dir = tempfile::tempdir().unwrap();
        let config = ReceiverConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            out_dir: out_dir.path().to_path_buf(),
            workers: 1,
            ..ReceiverConfig::default()
        };
        let listener = protocol::listener::bind(SocketAddr::new(config.listen_ip, 0), false).unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);
        let server_config = ReceiverConfig {
            port: bound.port(),
            ..config
        };
        let handle = tokio::spawn(run(server_config));
        tokio::time::sleep(Duration::from_millis(50)).await;

        send_frame(
            bound,
            ProtocolTag::WithDest,
            "passwd",
            Some("../../etc/passwd"),
            b"oops",
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert!(!out_dir
            .path()
            .parent()
            .unwrap()
            .join("etc/passwd")
            .exists());
    }

    #[tokio::test]
    async fn receives_a_with_dest_frame_under_a_nested_directory() {
        let out_dir = tempfile::tempdir().unwrap();
        let config = ReceiverConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            out_dir: out_dir.path().to_path_buf(),
            workers: 1,
            ..ReceiverConfig::default()
        };
        let listener = protocol::listener::bind(SocketAddr::new(config.listen_ip, 0), false).unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);
        let server_config = ReceiverConfig {
            port: bound.port(),
            ..config
        };
        let handle = tokio::spawn(run(server_config));
        tokio::time::sleep(Duration::from_millis(50)).await;

        send_frame(
            bound,
            ProtocolTag::WithDest,
            "b.jpg",
            Some("cam01/b.jpg"),
            b"payload",
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let contents = tokio::fs::read(out_dir.path().join("cam01/b.jpg"))
            .await
            .unwrap();
        assert_eq!(contents, b"payload");
    }

    #[tokio::test]
    async fn ignoring_dest_paths_writes_under_the_frame_name_instead() {
        let out_dir = tempfile::tempdir().unwrap();
        let listener = protocol::listener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), false)
            .unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);
        let server_config = ReceiverConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: bound.port(),
            out_dir: out_dir.path().to_path_buf(),
            workers: 1,
            use_dest_paths: false,
            ..ReceiverConfig::default()
        };
        let handle = tokio::spawn(run(server_config));
        tokio::time::sleep(Duration::from_millis(50)).await;

        send_frame(bound, ProtocolTag::WithDest, "c.jpg", Some("cam01/c.jpg"), b"ignored-dest").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let contents = tokio::fs::read(out_dir.path().join("c.jpg")).await.unwrap();
        assert_eq!(contents, b"ignored-dest");
        assert!(!out_dir.path().join("cam01").exists());
    }

    #[tokio::test]
    async fn count_first_session_closes_after_the_declared_number_of_files() {
        let out_dir = tempfile::tempdir().unwrap();
        let listener = protocol::listener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), false)
            .unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);
        let server_config = ReceiverConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: bound.port(),
            out_dir: out_dir.path().to_path_buf(),
            workers: 1,
            expect_count_first: true,
            ..ReceiverConfig::default()
        };
        let handle = tokio::spawn(run(server_config));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(bound).await.unwrap();
        protocol::frame::write_frame_count(&mut stream, 2).await.unwrap();
        for (name, payload) in [("a.jpg", b"one".as_slice()), ("b.jpg", b"two".as_slice())] {
            write_header(&mut stream, ProtocolTag::Legacy, name, None, payload.len() as u64)
                .await
                .unwrap();
            stream.write_all(payload).await.unwrap();
        }
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(tokio::fs::read(out_dir.path().join("a.jpg")).await.unwrap(), b"one");
        assert_eq!(tokio::fs::read(out_dir.path().join("b.jpg")).await.unwrap(), b"two");
    }
}
