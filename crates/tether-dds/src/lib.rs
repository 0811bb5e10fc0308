//! tether-dds: topic-based pub/sub over tether RPC sessions.
//!
//! Clients declare interest in topics by name; the server fans every publish
//! out to the topic's current subscriber set, excluding the publisher (whose
//! own handlers run via local dispatch instead). Delivery is best effort: a
//! slow subscriber backpressures only its own channel, and nothing is
//! retained across reconnects beyond the client re-declaring its topic list.

mod client;
mod msg;
mod server;

pub use client::{DdsClient, SubscriptionId};
pub use msg::TopicMessage;
pub use server::DdsServer;
