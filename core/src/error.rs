use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferError {
    #[error("empty response from transport")]
    EmptyResponse,
    #[error("response not successful: status {0}")]
    ResponseNotSuccessful(u16),
    #[error("unknown transfer failure: {0}")]
    UnknownTransferFailure(String),
    #[error("network unavailable")]
    NetworkUnavailable,
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("invalid transfer state: {0}")]
    InvalidState(String),
}

pub type TransferResult<T> = Result<T, TransferError>;
