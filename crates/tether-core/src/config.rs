//! Channel configuration.

/// Configuration for a [`FramedChannel`](crate::FramedChannel).
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Enable length framing: every message is sent as `u32 LE length || body`
    /// and inbound messages are reassembled from the same format. When false
    /// the channel is a raw passthrough. RPC channels require `true`.
    pub auto_pack: bool,
    /// Upper bound on the body size of an inbound frame. A frame announcing
    /// a larger body is a protocol error and closes the channel.
    pub max_body_size: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            auto_pack: false,
            max_body_size: u32::MAX,
        }
    }
}

impl ChannelConfig {
    /// Config with length framing enabled (the RPC configuration).
    pub fn packed() -> Self {
        Self {
            auto_pack: true,
            ..Self::default()
        }
    }

    /// Set the inbound frame body cap.
    pub fn with_max_body_size(mut self, max: u32) -> Self {
        self.max_body_size = max;
        self
    }
}
