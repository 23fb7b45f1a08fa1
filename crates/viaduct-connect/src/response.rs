//! Response protocol and the synthetic error response.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use viaduct_relay::RelayHandle;

use crate::connector::ConnectError;

/// Contract between a pluggable response and the connection loop that
/// delivers it.
///
/// The loop awaits [`ready`](ProxyResponse::ready), then pulls bytes with
/// [`read_next_chunk`](ProxyResponse::read_next_chunk) until
/// [`is_done`](ProxyResponse::is_done). Responses reporting
/// [`sends_raw_head`](ProxyResponse::sends_raw_head) emit complete wire
/// bytes (status line, headers and body); for all others the loop formats
/// the head from [`status_code`](ProxyResponse::status_code) and
/// [`content_length`](ProxyResponse::content_length) itself.
#[async_trait]
pub trait ProxyResponse: Send {
    /// Wait until the response head is known. Status and length queries are
    /// valid once this returns. Responses that are born ready do nothing.
    async fn ready(&mut self) {}

    fn status_code(&self) -> u16;

    /// Exact number of bytes left in the current response phase, or `None`
    /// when the response is no longer a bounded payload (a tunnel after
    /// handoff).
    fn content_length(&self) -> Option<u64>;

    /// Hand out up to `max_len` outbound bytes. Empty once the current
    /// phase is exhausted.
    fn read_next_chunk(&mut self, max_len: usize) -> Bytes;

    fn is_done(&self) -> bool;

    /// Whether the chunk stream already contains the status line and
    /// headers.
    fn sends_raw_head(&self) -> bool {
        false
    }

    /// Relinquish the client connection to this response once all pulled
    /// bytes have been flushed to it. A tunnel that has acknowledged the
    /// client takes ownership of the socket and returns the running relay;
    /// every other response declines and hands the socket back untouched.
    fn take_over(&mut self, client: TcpStream) -> Result<RelayHandle, TcpStream> {
        Err(client)
    }
}

/// Synthetic response carrying an HTTP error status and a short
/// human-readable body.
pub struct ErrorResponse {
    status: u16,
    remaining: Bytes,
}

impl ErrorResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            remaining: Bytes::from(body.into()),
        }
    }

    /// Error response for a failed tunnel connect attempt, with the status
    /// mapped from the failure kind.
    pub fn for_connect_error(err: &ConnectError) -> Self {
        Self::new(err.status_code(), format!("Tunnel setup failed: {}", err))
    }

    /// Unsent body bytes.
    pub fn body(&self) -> &Bytes {
        &self.remaining
    }
}

#[async_trait]
impl ProxyResponse for ErrorResponse {
    fn status_code(&self) -> u16 {
        self.status
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.remaining.len() as u64)
    }

    fn read_next_chunk(&mut self, max_len: usize) -> Bytes {
        let take = max_len.min(self.remaining.len());
        self.remaining.split_to(take)
    }

    fn is_done(&self) -> bool {
        self.remaining.is_empty()
    }
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// Render a complete error response: status line, minimal headers, body.
pub(crate) fn render_error_response(status: u16, body: &[u8]) -> Bytes {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason_phrase(status),
        body.len()
    );

    let mut wire = Vec::with_capacity(head.len() + body.len());
    wire.extend_from_slice(head.as_bytes());
    wire.extend_from_slice(body);
    Bytes::from(wire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_chunks_respect_max_len() {
        let mut response = ErrorResponse::new(502, "upstream said no");
        assert_eq!(response.status_code(), 502);
        assert_eq!(response.content_length(), Some(16));
        assert!(!response.is_done());

        let mut collected = Vec::new();
        loop {
            let chunk = response.read_next_chunk(5);
            if chunk.is_empty() {
                break;
            }
            assert!(chunk.len() <= 5);
            collected.extend_from_slice(&chunk);
        }

        assert_eq!(collected, b"upstream said no");
        assert!(response.is_done());
        assert_eq!(response.content_length(), Some(0));
        assert!(response.read_next_chunk(5).is_empty());
    }

    #[test]
    fn test_error_response_does_not_send_raw_head() {
        let response = ErrorResponse::new(404, "nope");
        assert!(!response.sends_raw_head());
    }

    #[tokio::test]
    async fn test_error_response_declines_take_over() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (socket, _) = listener.accept().await.unwrap();
        connect.await.unwrap();

        let mut response = ErrorResponse::new(502, "no tunnel here");
        match response.take_over(socket) {
            Err(returned) => {
                // The framework keeps a usable socket.
                assert!(returned.peer_addr().is_ok());
            }
            Ok(_) => panic!("error response must not start a relay"),
        }
    }

    #[test]
    fn test_render_error_response_wire_format() {
        let wire = render_error_response(502, b"connect refused");
        let text = std::str::from_utf8(&wire).unwrap();

        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Content-Length: 15\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nconnect refused"));
    }

    #[test]
    fn test_for_connect_error_maps_status() {
        let err = ConnectError::Refused {
            host: "127.0.0.1".to_string(),
            port: 9999,
        };
        let response = ErrorResponse::for_connect_error(&err);
        assert_eq!(response.status_code(), 502);
        assert!(std::str::from_utf8(response.body())
            .unwrap()
            .contains("127.0.0.1:9999"));
    }
}
