//! Upload destinations.

mod local;

use std::fmt;
use std::io::Read;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ContainerLabels, ContainerRef};

pub use local::LocalUploader;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("Upload rejected: {0}")]
    Rejected(String),

    #[error("Upload task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Content handed to an uploader.
pub enum UploadPayload {
    /// Small payloads, fully in memory.
    Bytes(Vec<u8>),
    /// Large payloads read incrementally on a blocking thread.
    Stream {
        reader: Box<dyn Read + Send>,
        size: u64,
    },
}

impl UploadPayload {
    pub fn size(&self) -> u64 {
        match self {
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::Stream { size, .. } => *size,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream { .. })
    }
}

impl fmt::Debug for UploadPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Stream { size, .. } => write!(f, "Stream({size} bytes)"),
        }
    }
}

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Find the destination container for a set of labels. `None` when the
    /// labels do not identify a container.
    async fn resolve(&self, labels: &ContainerLabels) -> Result<Option<ContainerRef>, UploadError>;

    /// Store one file in `container`.
    async fn upload(
        &self,
        container: &ContainerRef,
        filename: &str,
        payload: UploadPayload,
        metadata: &serde_json::Value,
    ) -> Result<(), UploadError>;
}

/// Reject names that would escape the container.
pub fn check_filename(filename: &str) -> Result<(), UploadError> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\'])
    {
        return Err(UploadError::InvalidName(filename.to_string()));
    }
    Ok(())
}
