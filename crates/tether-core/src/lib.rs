//! tether-core: framed stream channels and connection management.
//!
//! This crate is the transport floor of tether:
//! - [`FramedChannel`]: a byte stream turned into a length-prefixed message
//!   stream (or a raw passthrough), with `on_data`/`on_close` callbacks
//! - [`Endpoint`]: TCP, TLS-over-TCP, and Unix-domain stream addressing
//! - [`Acceptor`]: bound listener producing framed channels per connection
//! - [`Connector`]: outbound connect driver with automatic reconnect
//!
//! The RPC and pub/sub layers live in `tether-rpc` and `tether-dds`.

mod acceptor;
mod channel;
mod config;
mod connector;
mod endpoint;
mod error;

pub use acceptor::Acceptor;
pub use channel::FramedChannel;
pub use config::ChannelConfig;
pub use connector::{Connector, DEFAULT_RECONNECT_MS};
pub use endpoint::{Endpoint, IoStream};
pub use error::ChannelError;
