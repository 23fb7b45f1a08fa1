//! Raw byte relay between a client-facing connection and an upstream
//! destination.
//!
//! The two directions are independent: a stall on one leg never blocks the
//! other, and a graceful close on one side is forwarded as a half-close
//! while the opposite direction keeps flowing. Any read or write error is
//! fatal for the whole pair.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Read buffer size per relay direction.
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Errors that can terminate a relay
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("error relaying client to upstream: {0}")]
    ClientToUpstream(#[source] io::Error),

    #[error("error relaying upstream to client: {0}")]
    UpstreamToClient(#[source] io::Error),

    #[error("relay cancelled before completion")]
    Cancelled,
}

/// Byte totals for a completed relay, one counter per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Relay bytes between `client` and `upstream` until both directions close.
///
/// End-of-stream on one leg shuts down the write half of the other leg and
/// lets the remaining direction run on; the relay completes once both
/// directions have finished. The first I/O error on either leg cancels the
/// surviving direction, and both connections are closed when this function
/// returns.
pub async fn relay<C, U>(client: C, upstream: U) -> Result<RelayStats, RelayError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    // Client -> upstream direction
    let client_to_upstream = async {
        let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total_bytes = 0u64;
        loop {
            let n = client_read
                .read(&mut buffer)
                .await
                .map_err(RelayError::ClientToUpstream)?;
            if n == 0 {
                debug!("Client leg finished sending, forwarding half-close");
                let _ = upstream_write.shutdown().await;
                return Ok::<u64, RelayError>(total_bytes);
            }

            upstream_write
                .write_all(&buffer[..n])
                .await
                .map_err(RelayError::ClientToUpstream)?;
            upstream_write
                .flush()
                .await
                .map_err(RelayError::ClientToUpstream)?;
            total_bytes += n as u64;
        }
    };

    // Upstream -> client direction
    let upstream_to_client = async {
        let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total_bytes = 0u64;
        loop {
            let n = upstream_read
                .read(&mut buffer)
                .await
                .map_err(RelayError::UpstreamToClient)?;
            if n == 0 {
                debug!("Upstream leg finished sending, forwarding half-close");
                let _ = client_write.shutdown().await;
                return Ok::<u64, RelayError>(total_bytes);
            }

            client_write
                .write_all(&buffer[..n])
                .await
                .map_err(RelayError::UpstreamToClient)?;
            client_write
                .flush()
                .await
                .map_err(RelayError::UpstreamToClient)?;
            total_bytes += n as u64;
        }
    };

    // try_join! drops the surviving direction on the first error, which
    // closes both halves of both connections on the way out.
    let (client_to_upstream, upstream_to_client) =
        tokio::try_join!(client_to_upstream, upstream_to_client)?;

    Ok(RelayStats {
        client_to_upstream,
        upstream_to_client,
    })
}

/// Handle to a relay running on its own task.
///
/// Returned from the tunnel handoff; whoever owns the client connection's
/// lifetime holds this. Dropping the handle aborts the relay, which closes
/// both legs.
pub struct RelayHandle {
    task: JoinHandle<Result<RelayStats, RelayError>>,
}

impl RelayHandle {
    /// Spawn a relay between `client` and `upstream` on a new task.
    pub fn spawn<C, U>(client: C, upstream: U) -> Self
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let task = tokio::spawn(async move {
            match relay(client, upstream).await {
                Ok(stats) => {
                    debug!(
                        client_to_upstream = stats.client_to_upstream,
                        upstream_to_client = stats.upstream_to_client,
                        "Relay completed"
                    );
                    Ok(stats)
                }
                Err(e) => {
                    warn!("Relay failed: {}", e);
                    Err(e)
                }
            }
        });

        Self { task }
    }

    /// Abort the relay, closing both connections. Idempotent: shutting down
    /// an already-finished or already-aborted relay has no further effect.
    pub fn shutdown(&self) {
        self.task.abort();
    }

    /// Whether the relay task has terminated, gracefully or not.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the relay to terminate and report its outcome. An aborted
    /// relay reports [`RelayError::Cancelled`].
    pub async fn join(mut self) -> Result<RelayStats, RelayError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(join_err) => {
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
                Err(RelayError::Cancelled)
            }
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
