use thiserror::Error;

use crate::wire::WireError;

/// Errors surfaced by the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// No correlated reply arrived in time. Callers recover with a neutral
    /// result; the bus itself keeps running.
    #[error("timed out waiting for a correlated message")]
    Timeout,

    /// A frame that cannot be decoded. Dropped and logged, never fatal for
    /// the peer connection.
    #[error("malformed message (tag {tag:#06x}): {reason}")]
    Malformed { tag: u16, reason: String },

    #[error("codec error: {0}")]
    Wire(#[from] WireError),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
