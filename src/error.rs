//! Crate-wide error type.
//!
//! Mirrors the split used elsewhere in the pack's call/audio code: a typed
//! `thiserror` enum at library boundaries, with `anyhow::Context` layered on
//! top of it at the binary edge in `main.rs`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    Closed,

    #[error("frame payload too large ({len} bytes)")]
    Oversize { len: u16 },

    #[error("frame read did not complete within the retry budget")]
    Incomplete,

    #[error("endpoint is busy with another peer")]
    Busy,

    #[error("peer is unreachable")]
    Unreachable,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("operation timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, EndpointError>;
