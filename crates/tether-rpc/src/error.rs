//! RPC error types.

use core::fmt;

/// Terminal errors delivered to a call's `on_error` callback.
#[derive(Debug)]
pub enum RpcError {
    /// The connection closed (or was already closed) with the call pending.
    Closed,
    /// The response arrived but its payload did not decode as the expected
    /// type. The connection stays up.
    Decode(facet_postcard::DeserializeError),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Decode(e) => write!(f, "response decode failed: {e}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl RpcError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
