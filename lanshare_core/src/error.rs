use thiserror::Error;

/// Failures of a single transfer, on either transport.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Peer closed the stream while a declared-length field was still being read
    #[error("premature end of stream while reading {field}")]
    PrematureEndOfStream { field: &'static str },

    #[error("header field {field} declares {len} bytes (max {max})")]
    FieldTooLarge {
        field: &'static str,
        len: u64,
        max: u64,
    },

    #[error("header field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("transfer rejected by user")]
    Rejected,

    #[error("incomplete transfer: received {received}/{expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    #[error("nothing is shared")]
    NothingShared,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type TransferResult<T> = Result<T, TransferError>;
