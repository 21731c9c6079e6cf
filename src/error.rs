//! Error taxonomy shared by every fallible operation in this crate.

use thiserror::Error;

/// The single error currency crossing module boundaries in this crate.
///
/// Every public fallible function returns `Result<T, NcpError>`. Variants are
/// a closed set mirroring the failure categories the transport, mux, and
/// XMODEM state machines actually distinguish; this crate does not grow new
/// variants per module.
#[derive(Debug, Error)]
pub enum NcpError {
    #[error("error")]
    Error,

    #[error("out of memory")]
    NoMemory,

    #[error("resource busy")]
    Busy,

    #[error("invalid state")]
    InvalidState,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("not found")]
    NotFound,

    #[error("value out of range")]
    OutOfRange,

    #[error("limit exceeded")]
    LimitExceeded,

    #[error("buffer too small")]
    TooSmallBuffer,

    #[error("data too large")]
    TooLargeData,

    #[error("end of stream")]
    EndOfStream,

    #[error("invalid format")]
    InvalidFormat,

    #[error("cancelled")]
    Cancelled,

    #[error("aborted")]
    Aborted,

    #[error("timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error")]
    Protocol,

    #[error("internal error")]
    Internal,
}

pub type Result<T> = std::result::Result<T, NcpError>;
