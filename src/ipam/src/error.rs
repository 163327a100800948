use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("protocol mismatch")]
    ProtocolMismatch,

    #[error("address is not contained in the range")]
    NotContains,

    #[error("range is exhausted")]
    RangeExhausted,
}
