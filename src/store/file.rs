//! JSON-file backed resource store
//!
//! Survives process restarts, which is what lets the CLI resume an upload
//! that was interrupted by Ctrl-C or a crash.

use super::{ResourceStore, StoreError, StoredResource};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Store persisted as a pretty-printed JSON map of fingerprint to resource
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, StoredResource>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, StoredResource>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tmp = self
            .path
            .with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ResourceStore for JsonFileStore {
    fn find(&self, fingerprint: &str) -> Result<Option<StoredResource>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.remove(fingerprint))
    }

    fn save(&self, fingerprint: &str, resource: StoredResource) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all()?;
        entries.insert(fingerprint.to_string(), resource);
        self.write_all(&entries)
    }

    fn remove(&self, fingerprint: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all()?;
        if entries.remove(fingerprint).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}
