//! tether-rpc: request/response and notify semantics over tether framed
//! channels.
//!
//! The layering, bottom up:
//! - [`proto`]: the RPC wire format carried inside packed channel frames
//! - [`Rpc`]: the connection object: sequence numbers, the pending-call
//!   table with per-call timeouts and retries, and the command handler table
//! - [`RpcSession`]: one [`Rpc`] bound to one framed channel
//! - [`RpcServer`] / [`RpcClient`]: acceptor and connector wrappers that
//!   manage session lifetimes (including client-side reconnect)
//!
//! Payloads are typed at the API boundary (any `facet::Facet` value) and
//! opaque bytes on the wire.

mod client;
pub mod codec;
mod config;
mod error;
pub mod proto;
mod rpc;
mod server;
mod session;

pub use client::RpcClient;
pub use config::RpcConfig;
pub use error::RpcError;
pub use rpc::{CallBuilder, Rpc, WeakRpc};
pub use server::RpcServer;
pub use session::RpcSession;
