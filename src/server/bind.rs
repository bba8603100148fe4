//! Loopback listener and per-connection TCP keepalive
//!
//! The gateway only ever listens on `127.0.0.1`. Accepted sockets get TCP
//! keepalive packets so half-open connections from a crashed client are
//! eventually reaped.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::time::Duration;

use axum_server::accept::Accept;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::warn;

/// Keepalive period applied when none is configured.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(180);

/// Bind a non-blocking listener on `127.0.0.1:port` (`0` picks a free port).
pub fn bind_loopback(port: u16) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Enable keepalive packets on `stream` every `period`.
pub fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let params = TcpKeepalive::new().with_time(period).with_interval(period);
    SockRef::from(stream).set_tcp_keepalive(&params)
}

/// Acceptor that turns on TCP keepalive before handing the stream on.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveAcceptor {
    period: Duration,
}

impl KeepAliveAcceptor {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Default for KeepAliveAcceptor {
    fn default() -> Self {
        Self::new(DEFAULT_KEEP_ALIVE)
    }
}

impl<S> Accept<TcpStream, S> for KeepAliveAcceptor {
    type Stream = TcpStream;
    type Service = S;
    type Future = std::future::Ready<io::Result<(TcpStream, S)>>;

    fn accept(&self, stream: TcpStream, service: S) -> Self::Future {
        if let Err(e) = set_keepalive(&stream, self.period) {
            warn!(target: "gateway", error = %e, "failed to enable TCP keepalive");
        }
        std::future::ready(Ok((stream, service)))
    }
}
