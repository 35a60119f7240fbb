use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::conversation::RemoteRef;

pub const BLOB_ID_PREFIX: &str = "faust_image_";

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bytes: &[u8], mime_type: &str) -> Result<RemoteRef>;
    async fn delete(&self, id: &str) -> Result<()>;
}

pub fn new_blob_id() -> String {
    format!("{}{}", BLOB_ID_PREFIX, uuid::Uuid::new_v4())
}

/// Rejects anything that could escape the blob directory.
pub fn is_valid_blob_id(id: &str) -> bool {
    id.strip_prefix(BLOB_ID_PREFIX).is_some_and(|rest| {
        !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Blobs as files in one directory, each with a sidecar holding its mime type.
/// Served back over `GET /v1/blobs/:id`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create blob directory {}", root.display()))?;
        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url_for(&self, id: &str) -> String {
        format!("{}/v1/blobs/{}", self.public_base_url, id)
    }

    fn data_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn mime_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.mime", id))
    }

    /// Returns `(bytes, mime_type)`, or `None` if no such blob exists.
    pub async fn read(&self, id: &str) -> Result<Option<(Vec<u8>, String)>> {
        if !is_valid_blob_id(id) {
            return Ok(None);
        }
        let data_path = self.data_path(id);
        if !tokio::fs::try_exists(&data_path).await.unwrap_or(false) {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&data_path)
            .await
            .with_context(|| format!("Failed to read blob {}", id))?;
        let mime_type = tokio::fs::read_to_string(self.mime_path(id))
            .await
            .map(|mime| mime.trim().to_string())
            .unwrap_or_else(|_| "application/octet-stream".to_string());
        Ok(Some((bytes, mime_type)))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, bytes: &[u8], mime_type: &str) -> Result<RemoteRef> {
        let id = new_blob_id();
        tokio::fs::write(self.data_path(&id), bytes)
            .await
            .with_context(|| format!("Failed to write blob {}", id))?;
        tokio::fs::write(self.mime_path(&id), mime_type)
            .await
            .with_context(|| format!("Failed to write blob metadata {}", id))?;
        tracing::debug!("Stored blob {} ({} bytes, {})", id, bytes.len(), mime_type);
        Ok(RemoteRef {
            url: self.url_for(&id),
            id,
        })
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if !is_valid_blob_id(id) {
            bail!("Invalid blob id: {}", id);
        }
        tokio::fs::remove_file(self.data_path(id))
            .await
            .with_context(|| format!("Failed to delete blob {}", id))?;
        let _ = tokio::fs::remove_file(self.mime_path(id)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_ids_are_prefixed_and_validated() {
        let id = new_blob_id();
        assert!(id.starts_with(BLOB_ID_PREFIX));
        assert!(is_valid_blob_id(&id));
        assert!(!is_valid_blob_id("faust_image_"));
        assert!(!is_valid_blob_id("faust_image_../../etc/passwd"));
        assert!(!is_valid_blob_id("other_1234"));
    }

    #[tokio::test]
    async fn upload_read_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().join("blobs"), "http://127.0.0.1:8787/").unwrap();

        let remote = store.upload(&[1, 2, 3], "image/png").await.unwrap();
        assert_eq!(
            remote.url,
            format!("http://127.0.0.1:8787/v1/blobs/{}", remote.id)
        );

        let (bytes, mime) = store.read(&remote.id).await.unwrap().unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(mime, "image/png");

        store.delete(&remote.id).await.unwrap();
        assert!(store.read(&remote.id).await.unwrap().is_none());
        assert!(store.delete(&remote.id).await.is_err());
    }
}
