use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to create file {path}: {source}")]
    CreateFile { path: PathBuf, source: io::Error },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt log data in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Metadata encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// the LogStore trait speaks io::Result
impl From<StorageError> for io::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(inner) => inner,
            StorageError::Corrupt { .. } | StorageError::Codec(_) => {
                io::Error::new(io::ErrorKind::InvalidData, e)
            }
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
