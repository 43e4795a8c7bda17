//! File-like inputs for the send path.

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Something with a name and a size that can be read in byte ranges.
#[async_trait]
pub trait FileSource: Send + Sync {
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    /// Read `start..end`. Callers never ask past `size()`.
    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes>;
}

/// A file held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    name: String,
    data: Bytes,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl FileSource for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        ensure!(
            start <= end && end <= self.size(),
            "range {start}..{end} outside {} bytes",
            self.size()
        );
        Ok(self.data.slice(start as usize..end as usize))
    }
}

/// A file on disk, opened per read.
#[derive(Debug, Clone)]
pub struct DiskFile {
    path: PathBuf,
    name: String,
    size: u64,
}

impl DiskFile {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("cannot stat {}", path.display()))?;
        ensure!(meta.is_file(), "{} is not a regular file", path.display());

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        Ok(Self {
            path,
            name,
            size: meta.len(),
        })
    }
}

#[async_trait]
impl FileSource for DiskFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        ensure!(start <= end && end <= self.size, "range {start}..{end} outside file");
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("cannot open {}", self.path.display()))?;
        file.seek(std::io::SeekFrom::Start(start)).await?;

        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)
            .await
            .with_context(|| format!("short read from {}", self.path.display()))?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_file_ranges() {
        let f = MemoryFile::new("m.bin", vec![1u8, 2, 3, 4, 5]);
        assert_eq!(f.size(), 5);
        assert_eq!(&f.read_range(1, 4).await.unwrap()[..], &[2, 3, 4]);
        assert!(f.read_range(4, 6).await.is_err());
    }

    #[tokio::test]
    async fn disk_file_reads_ranges() {
        let dir = std::env::temp_dir().join(format!("peerbeam-src-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("data.bin");
        let content: Vec<u8> = (0..=255u8).collect();
        tokio::fs::write(&path, &content).await.unwrap();

        let f = DiskFile::open(&path).await.unwrap();
        assert_eq!(f.name(), "data.bin");
        assert_eq!(f.size(), 256);
        assert_eq!(&f.read_range(250, 256).await.unwrap()[..], &content[250..]);

        assert!(DiskFile::open(&dir).await.is_err());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
