//! Local-disk and in-memory uploadable files

use super::{check_range, UploadError, UploadableFile, DEFAULT_MIME_TYPE};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// A file on local disk
///
/// The size is captured when the handle is opened; each range read opens the
/// file again so the handle holds no descriptor between reads.
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
    name: String,
    mime_type: String,
    size: u64,
}

impl LocalFile {
    /// Open a file, using `mime_type` or the default octet-stream type
    pub async fn open<P: AsRef<Path>>(
        path: P,
        mime_type: Option<&str>,
    ) -> Result<Self, UploadError> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(UploadError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            name,
            mime_type: mime_type.unwrap_or(DEFAULT_MIME_TYPE).to_string(),
            size: metadata.len(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl UploadableFile for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes, UploadError> {
        check_range(offset, len, self.size)?;

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// A file held in memory
#[derive(Debug, Clone)]
pub struct MemoryFile {
    name: String,
    mime_type: String,
    data: Bytes,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl UploadableFile for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes, UploadError> {
        check_range(offset, len, self.size())?;
        let start = offset as usize;
        Ok(self.data.slice(start..start + len as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_local_file_reads_range() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();

        let file = LocalFile::open(tmp.path(), Some("text/plain")).await.unwrap();
        assert_eq!(file.size(), 10);
        assert_eq!(file.mime_type(), "text/plain");

        let bytes = file.read_range(3, 4).await.unwrap();
        assert_eq!(&bytes[..], b"3456");
    }

    #[tokio::test]
    async fn test_local_file_default_mime() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = LocalFile::open(tmp.path(), None).await.unwrap();
        assert_eq!(file.mime_type(), DEFAULT_MIME_TYPE);
        assert_eq!(file.size(), 0);
    }

    #[tokio::test]
    async fn test_local_file_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalFile::open(dir.path(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_file_out_of_bounds() {
        let file = MemoryFile::new("a.bin", DEFAULT_MIME_TYPE, vec![1u8, 2, 3]);
        assert!(matches!(
            file.read_range(2, 5).await,
            Err(UploadError::RangeOutOfBounds { .. })
        ));
        assert_eq!(&file.read_range(1, 2).await.unwrap()[..], &[2, 3]);
    }
}
