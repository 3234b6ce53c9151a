//! Error types for the client layer.

use thiserror::Error;

use crate::wire::WireError;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by connections, pools, and codecs.
///
/// The library performs no retries; every error is reported to the caller.
/// Wire errors additionally taint the connection, which the pool destroys
/// at release time.
#[derive(Error, Debug)]
pub enum Error {
    /// NULL arrived for a destination that cannot represent it.
    #[error("NULL cannot be converted to {ty}")]
    NullConversion { ty: &'static str },

    /// A fixed-width payload had the wrong length.
    #[error("{ty} requires data length of {expected}, got {got}")]
    SizeMismatch {
        ty: &'static str,
        expected: usize,
        got: usize,
    },

    /// A payload could not be decoded for a reason other than its length.
    #[error("cannot decode {ty}: {reason}")]
    Decode { ty: &'static str, reason: String },

    /// Error reported by the wire driver, propagated verbatim.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The operation's cancellation context fired.
    #[error("operation canceled")]
    Canceled,

    /// A statement inside the transaction failed and the whole
    /// transaction was rolled back.
    #[error("rolled back failed transaction")]
    TransactionAbort,

    /// The transaction callback committed or rolled back on its own.
    #[error("not in transaction after calling f")]
    TransactionMisuse,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The pool rejected the operation because it has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Error produced by caller code (row callbacks, transaction bodies).
    #[error(transparent)]
    External(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary application error, e.g. for returning out of a
    /// row callback or a transaction body.
    pub fn external(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::External(err.into())
    }
}
