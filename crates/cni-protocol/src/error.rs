//! Attach protocol errors

use thiserror::Error;

/// Failures encoding, decoding or transporting attach messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("failed to decode request: {0}")]
    Decode(String),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("connection error: {0}")]
    Io(String),

    #[error("message exceeds {0} bytes")]
    TooLarge(usize),

    /// The peer hung up without sending anything
    #[error("connection closed before a message was received")]
    Closed,

    #[error("missing CNI arg {0}")]
    MissingArg(String),

    /// A key outside the known set, without `IgnoreUnknown`
    #[error("unknown CNI arg {0} (set IgnoreUnknown=1 to allow)")]
    UnknownArg(String),

    #[error("malformed CNI args: {0}")]
    MalformedArgs(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e.to_string())
    }
}
