//! Resource store
//!
//! Remembers the server-side resource created for a file so a later session
//! (or a later process) can locate it again instead of starting over.
//!
//! Entries are keyed by a fingerprint of the file identity: endpoint, name,
//! MIME type and size.

use crate::upload::UploadableFile;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

pub mod file;

pub use file::JsonFileStore;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

/// A remembered upload resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResource {
    pub url: String,
    pub file_name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Compute the identity fingerprint of a file uploaded to `endpoint`
pub fn fingerprint(endpoint: &str, file: &dyn UploadableFile) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update(b"|");
    hasher.update(file.name().as_bytes());
    hasher.update(b"|");
    hasher.update(file.mime_type().as_bytes());
    hasher.update(b"|");
    hasher.update(file.size().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Persistence for resource hints
pub trait ResourceStore: Send + Sync {
    fn find(&self, fingerprint: &str) -> Result<Option<StoredResource>, StoreError>;

    fn save(&self, fingerprint: &str, resource: StoredResource) -> Result<(), StoreError>;

    fn remove(&self, fingerprint: &str) -> Result<(), StoreError>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredResource>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ResourceStore for MemoryStore {
    fn find(&self, fingerprint: &str) -> Result<Option<StoredResource>, StoreError> {
        Ok(self.entries.lock().get(fingerprint).cloned())
    }

    fn save(&self, fingerprint: &str, resource: StoredResource) -> Result<(), StoreError> {
        self.entries.lock().insert(fingerprint.to_string(), resource);
        Ok(())
    }

    fn remove(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(fingerprint);
        Ok(())
    }
}
