//! tether: stacked services over stream transports.
//!
//! Three layers, each usable on its own:
//!
//! - **Framed channels** ([`FramedChannel`], [`Acceptor`], [`Connector`]):
//!   length-prefixed message streams over TCP, TLS, or Unix sockets, with a
//!   configurable inbound size bound and client-side automatic reconnect.
//! - **RPC** ([`RpcServer`], [`RpcClient`], [`Rpc`]): request/response and
//!   notify semantics with per-call timeouts and retries, plus server-push
//!   via command subscription.
//! - **Pub/sub** ([`DdsServer`], [`DdsClient`]): clients subscribe to topics
//!   by name, publish samples, and the server fans each sample out to the
//!   topic's current subscribers (excluding the publisher).
//!
//! # Example
//!
//! ```ignore
//! use tether::prelude::*;
//!
//! let server = RpcServer::bind_tcp("127.0.0.1:9000", RpcConfig::default()).await?;
//! server.on_session(|session| {
//!     session.rpc().subscribe("add", |(a, b): (i32, i32)| a + b);
//! });
//! tokio::spawn(async move { server.serve().await });
//!
//! let client = RpcClient::new(Endpoint::tcp("127.0.0.1:9000"), RpcConfig::default());
//! client.on_open(|rpc| {
//!     rpc.cmd("add")
//!         .msg(&(2i32, 3i32))
//!         .rsp(|sum: i32| println!("sum = {sum}"))
//!         .call();
//! });
//! client.open();
//! ```

pub use tether_core::{
    Acceptor, ChannelConfig, ChannelError, Connector, Endpoint, FramedChannel, IoStream,
};
pub use tether_dds::{DdsClient, DdsServer, SubscriptionId, TopicMessage};
pub use tether_rpc::{
    codec, proto, CallBuilder, Rpc, RpcClient, RpcConfig, RpcError, RpcServer, RpcSession, WeakRpc,
};

// Payload types derive `facet::Facet`; re-exported so downstream crates need
// no direct facet dependency.
pub use facet;

/// Convenient imports for the common client/server flows.
pub mod prelude {
    pub use crate::{
        ChannelConfig, DdsClient, DdsServer, Endpoint, Rpc, RpcClient, RpcConfig, RpcError,
        RpcServer, TopicMessage,
    };
    pub use facet::Facet;
}
