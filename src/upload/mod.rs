//! Upload module
//!
//! The byte sources a session transfers. A file handle is supplied by the
//! caller, read in arbitrary ranges, and never mutated by the session.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod file;

pub use file::{LocalFile, MemoryFile};

/// Default MIME type when the caller does not know one
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Errors reading an uploadable file
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Range {offset}+{len} is outside a file of {size} bytes")]
    RangeOutOfBounds { offset: u64, len: u64, size: u64 },
}

/// A handle to the bytes of one file
///
/// Implementations must return the same bytes for the same range for the
/// whole life of a session.
#[async_trait]
pub trait UploadableFile: Send + Sync {
    /// File name reported to the server
    fn name(&self) -> &str;

    /// MIME type reported to the server
    fn mime_type(&self) -> &str;

    /// Total length in bytes
    fn size(&self) -> u64;

    /// Read `[offset, offset + len)`
    async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes, UploadError>;
}

/// Check a requested range against a file size
pub(crate) fn check_range(offset: u64, len: u64, size: u64) -> Result<(), UploadError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(UploadError::RangeOutOfBounds { offset, len, size }),
    }
}
