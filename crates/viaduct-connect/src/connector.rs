//! Destination connector: opens the upstream leg of a tunnel.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// Options for a single destination connect attempt.
#[derive(Debug, Clone)]
pub struct ConnectOpts {
    /// Bound on the whole attempt, name resolution included.
    pub timeout: Duration,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

/// Errors that can occur while opening the destination leg
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid tunnel target {target:?}")]
    InvalidTarget { target: String },

    #[error("connection refused by {host}:{port}")]
    Refused { host: String, port: u16 },

    #[error("timed out connecting to {host}:{port}")]
    Timeout { host: String, port: u16 },

    #[error("failed to resolve {host}: {source}")]
    Dns { host: String, source: io::Error },

    #[error("failed to connect to {host}:{port}: {source}")]
    Io {
        host: String,
        port: u16,
        source: io::Error,
    },
}

impl ConnectError {
    /// HTTP status reported to the proxy client for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            ConnectError::InvalidTarget { .. } => 400,
            ConnectError::Timeout { .. } => 504,
            ConnectError::Refused { .. } | ConnectError::Dns { .. } | ConnectError::Io { .. } => {
                502
            }
        }
    }
}

/// Open a TCP connection to `host:port` on behalf of a tunnel request.
///
/// Makes exactly one pass over the resolved addresses; retrying is the
/// caller's decision. The whole attempt is bounded by
/// [`ConnectOpts::timeout`].
pub async fn connect(host: &str, port: u16, opts: &ConnectOpts) -> Result<TcpStream, ConnectError> {
    validate_target(host, port)?;

    let stream = timeout(opts.timeout, connect_resolved(host, port))
        .await
        .map_err(|_| ConnectError::Timeout {
            host: host.to_string(),
            port,
        })??;

    // Tunnel traffic is latency sensitive; a socket without NODELAY is
    // still a working tunnel, so the result is ignored.
    let _ = stream.set_nodelay(true);

    debug!(host = %host, port = port, "Destination connected");
    Ok(stream)
}

fn validate_target(host: &str, port: u16) -> Result<(), ConnectError> {
    let malformed = host.is_empty()
        || port == 0
        || host.chars().any(|c| c.is_whitespace() || c.is_control());

    if malformed {
        return Err(ConnectError::InvalidTarget {
            target: format!("{}:{}", host, port),
        });
    }

    Ok(())
}

async fn connect_resolved(host: &str, port: u16) -> Result<TcpStream, ConnectError> {
    let addrs: Vec<SocketAddr> =
        lookup_host((host, port))
            .await
            .map_err(|e| ConnectError::Dns {
                host: host.to_string(),
                source: e,
            })?
            .collect();

    if addrs.is_empty() {
        return Err(ConnectError::Dns {
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
        });
    }

    let mut last_err: Option<io::Error> = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(host = %host, port = port, addr = %addr, "Connect attempt failed: {}", e);
                last_err = Some(e);
            }
        }
    }

    // addrs was non-empty, so at least one attempt recorded its error.
    let source = last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no connect attempt was made"));

    if source.kind() == io::ErrorKind::ConnectionRefused {
        Err(ConnectError::Refused {
            host: host.to_string(),
            port,
        })
    } else {
        Err(ConnectError::Io {
            host: host.to_string(),
            port,
            source,
        })
    }
}
