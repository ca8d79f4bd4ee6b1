use std::io;
use std::path::{Path, PathBuf};

use canvas_core::CanvasError;
use thiserror::Error;

use super::tree::TreeError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("api error: {0}")]
    Api(#[from] CanvasError),
    #[error("inconsistent listing: {0}")]
    Tree(#[from] TreeError),
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("size mismatch for {}: expected {expected} bytes, received {actual}", .path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        SyncError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// True when the server refused the credentials; worth telling the user to check the token.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Api(err) if err.is_auth())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Api(CanvasError::Request(err))
    }
}
