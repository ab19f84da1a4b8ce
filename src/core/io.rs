use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Readers see either the old content or the new content, never a torn file.
    async fn write_atomic(&self, path: &str, content: &[u8]) -> Result<()> {
        let tmp = format!("{}.tmp", path);
        self.write(&tmp, content).await?;
        self.rename(&tmp, path).await
    }
}

pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

async fn ensure_parent(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        ensure_parent(path).await?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path))?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        ensure_parent(to).await?;
        tokio::fs::rename(from, to)
            .await
            .with_context(|| format!("Failed to move {} to {}", from, to))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            if Path::new(path).is_dir() {
                tokio::fs::remove_dir_all(path).await?;
            } else {
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = Path::new(prefix);
        let mut entries = Vec::new();

        if path.is_dir() {
            let mut dir = tokio::fs::read_dir(path).await?;
            while let Some(entry) = dir.next_entry().await? {
                entries.push(entry.path().to_string_lossy().to_string());
            }
        } else if path.exists() {
            entries.push(prefix.to_string());
        }

        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_content() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("nested/record.json");
        let path_str = path.to_str().unwrap();
        let storage = NativeStorage::new();

        storage.write_atomic(path_str, b"first").await?;
        storage.write_atomic(path_str, b"second").await?;

        assert_eq!(storage.read(path_str).await?, b"second");
        assert!(!storage.exists(&format!("{}.tmp", path_str)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_is_sorted() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        for name in ["b.json", "a.json"] {
            let p = temp_dir.path().join(name);
            storage.write(p.to_str().unwrap(), b"{}").await?;
        }
        let listed = storage.list(temp_dir.path().to_str().unwrap()).await?;
        assert_eq!(listed.len(), 2);
        assert!(listed[0].ends_with("a.json"));
        Ok(())
    }
}
