//! Error type for the disk store

use stowage_common::Error;

/// Error type for disk store operations
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("store initialization failed: {0}")]
    Init(String),
}

pub type KvResult<T> = Result<T, KvError>;

impl From<KvError> for Error {
    fn from(e: KvError) -> Self {
        match e {
            KvError::Io(e) => Self::Io(e),
            KvError::IndexUnavailable(msg) => Self::IndexUnavailable(msg),
            KvError::InvalidArgument(msg) => Self::InvalidArgument(msg.to_string()),
            KvError::Init(msg) => Self::Construction(msg),
            e @ KvError::Sqlite(_) => Self::Storage(e.to_string()),
        }
    }
}
