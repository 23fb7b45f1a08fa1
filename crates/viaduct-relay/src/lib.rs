//! Bidirectional byte relay between two established connections.
//!
//! Once a tunnel has been negotiated, the relay owns both legs and pumps
//! opaque bytes between them until both directions have closed or either
//! leg fails.

pub mod relay;

pub use relay::{relay, RelayError, RelayHandle, RelayStats};
