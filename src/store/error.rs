use thiserror::Error;

use crate::model::RoomId;

/// Failures of the allocation store. Any of these means the attempted
/// transaction did not happen.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown room: {0}")]
    UnknownRoom(RoomId),
    #[error("invalid room: {0}")]
    InvalidRoom(&'static str),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("transaction already finished")]
    TxFinished,
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("store closed")]
    Closed,
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Wal(e.to_string())
    }
}
