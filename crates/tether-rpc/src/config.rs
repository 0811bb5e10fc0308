//! RPC configuration.

use tether_core::ChannelConfig;

/// Per-connection call defaults and channel limits. Individual calls
/// override the call defaults through the builder.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Default per-call timeout in milliseconds.
    pub call_timeout_ms: u32,
    /// Default per-call retry count. `-1` retries forever; `0` fails on the
    /// first timeout.
    pub retry_count: i32,
    /// Inbound frame body cap for the underlying channel.
    pub max_body_size: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 3000,
            retry_count: 0,
            max_body_size: u32::MAX,
        }
    }
}

impl RpcConfig {
    /// Channel configuration for this connection. RPC always runs over
    /// packed channels.
    pub(crate) fn channel_config(&self) -> ChannelConfig {
        ChannelConfig::packed().with_max_body_size(self.max_body_size)
    }
}
