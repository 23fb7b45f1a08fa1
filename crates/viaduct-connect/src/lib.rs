//! CONNECT-style tunnel and error responses for an HTTP proxy.
//!
//! Plugs into a connection-handling framework through the [`ProxyResponse`]
//! protocol: the framework parses the request and pulls response bytes;
//! this crate opens the destination leg, acknowledges the client, and hands
//! both connections to the byte relay.

pub mod connector;
pub mod response;
pub mod tunnel;

pub use connector::{connect, ConnectError, ConnectOpts};
pub use response::{ErrorResponse, ProxyResponse};
pub use tunnel::{TunnelRequest, TunnelResponse};
