//! Channel error types.

use core::fmt;
use std::io;

/// Errors that terminate a channel.
///
/// These are not delivered through `on_close` (which is deliberately
/// argument-free); they are logged at the point of failure and exposed
/// where channel operations return a `Result`.
#[derive(Debug)]
pub enum ChannelError {
    /// The channel was closed locally or by the peer.
    Closed,
    /// Transport I/O failed.
    Io(io::Error),
    /// An inbound frame announced a body larger than the configured cap.
    Oversize { len: u32, max: u32 },
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "channel closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Oversize { len, max } => {
                write!(f, "inbound frame body {len} bytes exceeds max {max}")
            }
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
