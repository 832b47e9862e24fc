//! tus client module
//!
//! Chunked Transfer Client for the tus 1.0.0 resumable upload protocol.
//!
//! # Features
//!
//! - **Creation**: `POST` to the endpoint with `Upload-Length` and `Upload-Metadata`
//! - **Status**: `HEAD` a resource to learn how many bytes the server holds
//! - **Ranges**: `PATCH` one chunk at a time, streaming progress while in flight
//! - **Retries**: transient failures are retried after a fixed delay sequence
//! - **Abort**: every range runs on its own task and can be aborted at any time
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tus_uploadr::tus::{TusClient, TusClientConfig, Transport};
//! use tus_uploadr::upload::{LocalFile, UploadableFile};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = TusClient::new(TusClientConfig::new("http://localhost:8080/tus-files/"))?;
//! let file: Arc<dyn UploadableFile> = Arc::new(LocalFile::open("movie.mp4", Some("video/mp4")).await?);
//!
//! let resource = client.create_or_locate(file.clone(), None).await?;
//! let handle = client.send_range(&resource, file, resource.received_bytes, Arc::new(|sent, total| {
//!     println!("{sent}/{total}");
//! }));
//! let received = handle.outcome().await?;
//! println!("Server holds {received} bytes");
//! # Ok(())
//! # }
//! ```
//!
//! # Tracing
//!
//! | Operation | Span Name | Attributes |
//! |-----------|-----------|------------|
//! | Create | `tus.create` | upload.bytes, tus.location, http.status_code |
//! | Status | `tus.head` | tus.resource, tus.offset, http.status_code |
//! | Range | `tus.patch` | tus.resource, tus.from_offset, upload.bytes, tus.offset, http.status_code |
//! | Terminate | `tus.delete` | tus.resource, http.status_code |

use crate::store::StoredResource;
use crate::upload::{UploadError, UploadableFile};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

mod client;
pub mod handle;
pub mod protocol;
pub mod retry;

pub use client::{TusClient, TusClientConfig};
pub use handle::{LiveRequest, RangeHandle};
pub use retry::RetryPolicy;

/// tus client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Upload resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Server rejected request ({status}): {message}")]
    ServerRejected { status: u16, message: String },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("File error: {0}")]
    FileError(#[from] UploadError),

    #[error("Request aborted")]
    Aborted,
}

impl ClientError {
    /// Whether the client retries this error in place
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::TransportError(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::TransportError(e.to_string())
    }
}

/// Server-side identity of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResource {
    /// Absolute resource URL
    pub url: String,
    /// Bytes the server reported holding when this value was obtained
    pub received_bytes: u64,
}

/// Progress callback: `(bytes_uploaded, bytes_total)`
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Wire operations the session controller depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Creation endpoint, part of the file fingerprint
    fn endpoint(&self) -> String;

    /// Reuse `prior` if the server still knows it, otherwise create a resource
    async fn create_or_locate(
        &self,
        file: Arc<dyn UploadableFile>,
        prior: Option<StoredResource>,
    ) -> Result<UploadResource, ClientError>;

    /// Bytes the server has stored for `resource`
    async fn query_received_bytes(&self, resource: &UploadResource) -> Result<u64, ClientError>;

    /// Start sending the next range from `from_offset`
    fn send_range(
        &self,
        resource: &UploadResource,
        file: Arc<dyn UploadableFile>,
        from_offset: u64,
        progress: ProgressCallback,
    ) -> RangeHandle;

    /// Ask the server to discard `resource`
    async fn terminate(&self, resource: &UploadResource) -> Result<(), ClientError>;
}
