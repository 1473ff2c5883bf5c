//! Reuseport-capable TCP listener bind helper.
//!
//! Builds the socket explicitly instead of via `TcpListener::bind` so
//! `SO_REUSEPORT` can be set before the bind call, letting `M` independent
//! worker processes share one port and let the kernel load-balance accepts
//! across them.

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpSocket};

/// Bind a TCP listener at `addr`. When `reuseport` is set, `SO_REUSEPORT`
/// (and `SO_REUSEADDR`) are enabled before binding so multiple processes
/// can share the port.
pub fn bind(addr: std::net::SocketAddr, reuseport: bool) -> Result<TcpListener> {
    let socket = if addr.is_ipv6() {
        TcpSocket::new_v6()
    } else {
        TcpSocket::new_v4()
    }
    .with_context(|| format!("failed to create socket for {addr}"))?;
    if reuseport {
        socket
            .set_reuseaddr(true)
            .context("failed to set SO_REUSEADDR")?;
        #[cfg(unix)]
        socket
            .set_reuseport(true)
            .context("failed to set SO_REUSEPORT")?;
    }
    socket
        .bind(addr)
        .with_context(|| format!("failed to bind {addr}"))?;
    socket
        .listen(1024)
        .with_context(|| format!("failed to listen on {addr}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_an_ephemeral_port() {
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = bind(addr, false).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn two_reuseport_listeners_can_share_one_port() {
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let first = bind(addr, true).unwrap();
        let bound = first.local_addr().unwrap();
        let second = bind(bound, true);
        assert!(second.is_ok());
    }
}
