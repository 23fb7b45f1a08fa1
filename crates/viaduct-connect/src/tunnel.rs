//! CONNECT tunnel response controller.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use viaduct_relay::RelayHandle;

use crate::connector::{self, ConnectError, ConnectOpts};
use crate::response::{render_error_response, ErrorResponse, ProxyResponse};

/// Acknowledgment sent to the proxy client once the destination leg is up.
const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// A CONNECT-style tunnel request: where to open the destination leg.
///
/// The client-facing connection stays with the framework that dispatched
/// the request; it changes hands only at relay handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub host: String,
    pub port: u16,
}

impl TunnelRequest {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

enum State {
    Connecting {
        attempt: JoinHandle<Result<TcpStream, ConnectError>>,
    },
    Established {
        upstream: TcpStream,
        pending: Bytes,
    },
    Failed {
        pending: Bytes,
    },
    Relaying,
    Closed,
}

/// Tunnel response for a CONNECT-style proxy request.
///
/// Construction starts the destination connect attempt. [`ready`] resolves
/// it: on success the outbound bytes are the fixed `200 Connection
/// Established` acknowledgment, on failure a complete HTTP error response.
/// After the acknowledgment has been drained and flushed, the framework
/// calls [`take_over`] to move the client socket in; both connections then
/// belong to the relay, and this controller is out of the data path.
///
/// Each instance handles exactly one tunnel attempt; there is no way back
/// into `Connecting`.
///
/// [`ready`]: ProxyResponse::ready
/// [`take_over`]: ProxyResponse::take_over
pub struct TunnelResponse {
    host: String,
    port: u16,
    status: u16,
    state: State,
}

impl TunnelResponse {
    /// Tunnel to `host:port` with default connect options.
    ///
    /// Must be called within a tokio runtime: the connect attempt is
    /// spawned immediately.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_opts(host, port, ConnectOpts::default())
    }

    /// Consume a dispatched tunnel request.
    pub fn for_request(request: TunnelRequest) -> Self {
        Self::new(request.host, request.port)
    }

    pub fn with_opts(host: impl Into<String>, port: u16, opts: ConnectOpts) -> Self {
        let host = host.into();

        let attempt = {
            let host = host.clone();
            tokio::spawn(async move { connector::connect(&host, port, &opts).await })
        };
        debug!(host = %host, port = port, "Tunnel connect attempt started");

        Self {
            host,
            port,
            status: 200,
            state: State::Connecting { attempt },
        }
    }

    /// Current lifecycle stage, for logging and inspection.
    pub fn state_name(&self) -> &'static str {
        match &self.state {
            State::Connecting { .. } => "connecting",
            State::Established { .. } => "established",
            State::Failed { .. } => "failed",
            State::Relaying => "relaying",
            State::Closed => "closed",
        }
    }

    /// Tear the tunnel down. A pending connect attempt is cancelled and its
    /// eventual result discarded. Idempotent.
    pub fn close(&mut self) {
        if let State::Connecting { attempt } = &self.state {
            attempt.abort();
            debug!(host = %self.host, port = self.port, "Tunnel connect attempt cancelled");
        }
        self.state = State::Closed;
    }
}

#[async_trait]
impl ProxyResponse for TunnelResponse {
    async fn ready(&mut self) {
        let joined = match &mut self.state {
            State::Connecting { attempt } => attempt.await,
            _ => return,
        };

        let connected = match joined {
            Ok(result) => result,
            // The attempt task itself died; surface it as a dial failure.
            Err(join_err) => Err(ConnectError::Io {
                host: self.host.clone(),
                port: self.port,
                source: std::io::Error::new(std::io::ErrorKind::Other, join_err.to_string()),
            }),
        };

        match connected {
            Ok(upstream) => {
                info!(host = %self.host, port = self.port, "Tunnel established");
                self.status = 200;
                self.state = State::Established {
                    upstream,
                    pending: Bytes::from_static(ESTABLISHED),
                };
            }
            Err(err) => {
                warn!(host = %self.host, port = self.port, "Tunnel connect failed: {}", err);
                let error_response = ErrorResponse::for_connect_error(&err);
                self.status = error_response.status_code();
                self.state = State::Failed {
                    pending: render_error_response(self.status, error_response.body()),
                };
            }
        }
    }

    fn status_code(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<u64> {
        match &self.state {
            State::Established { pending, .. } | State::Failed { pending } => {
                Some(pending.len() as u64)
            }
            State::Connecting { .. } | State::Relaying | State::Closed => None,
        }
    }

    fn read_next_chunk(&mut self, max_len: usize) -> Bytes {
        match &mut self.state {
            State::Established { pending, .. } | State::Failed { pending } => {
                let take = max_len.min(pending.len());
                pending.split_to(take)
            }
            _ => Bytes::new(),
        }
    }

    fn is_done(&self) -> bool {
        match &self.state {
            State::Connecting { .. } => false,
            State::Established { pending, .. } | State::Failed { pending } => pending.is_empty(),
            State::Relaying | State::Closed => true,
        }
    }

    fn sends_raw_head(&self) -> bool {
        true
    }

    fn take_over(&mut self, client: TcpStream) -> Result<RelayHandle, TcpStream> {
        match std::mem::replace(&mut self.state, State::Relaying) {
            State::Established { upstream, pending } if pending.is_empty() => {
                debug!(host = %self.host, port = self.port, "Handing tunnel over to relay");
                Ok(RelayHandle::spawn(client, upstream))
            }
            other => {
                // Not ready for a handoff; restore the state and hand the
                // socket back.
                self.state = other;
                Err(client)
            }
        }
    }
}

impl Drop for TunnelResponse {
    fn drop(&mut self) {
        if let State::Connecting { attempt } = &self.state {
            attempt.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_states_on_success_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut response = TunnelResponse::new(addr.ip().to_string(), addr.port());
        assert_eq!(response.state_name(), "connecting");
        assert!(!response.is_done());
        assert_eq!(response.content_length(), None);

        response.ready().await;
        assert_eq!(response.state_name(), "established");
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.content_length(), Some(ESTABLISHED.len() as u64));
        assert!(response.sends_raw_head());
    }

    #[tokio::test]
    async fn test_ready_is_idempotent_after_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut response = TunnelResponse::new("127.0.0.1", port);
        response.ready().await;
        assert_eq!(response.state_name(), "failed");
        assert_eq!(response.status_code(), 502);

        // A second ready() must not restart the attempt.
        response.ready().await;
        assert_eq!(response.state_name(), "failed");
        assert_eq!(response.status_code(), 502);
    }

    #[tokio::test]
    async fn test_close_while_connecting_cancels_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut response = TunnelResponse::new(addr.ip().to_string(), addr.port());
        response.close();
        assert_eq!(response.state_name(), "closed");
        assert!(response.is_done());

        response.close();
        assert_eq!(response.state_name(), "closed");
    }

    #[tokio::test]
    async fn test_chunks_empty_while_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut response = TunnelResponse::new(addr.ip().to_string(), addr.port());
        assert!(response.read_next_chunk(64).is_empty());
        response.close();
    }
}
