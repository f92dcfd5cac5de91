use std::path::PathBuf;

use async_trait::async_trait;
use tracing::error;

use super::BlobStore;
use crate::errors::AppError;

/// Attachment blobs on the local filesystem, laid out as
/// `<root>/<base path>/<message id>/<file name>`.
#[derive(Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, base_path: &str, message_id: &str, file_name: &str) -> Result<PathBuf, AppError> {
        for segment in [base_path, message_id, file_name] {
            if segment.is_empty() || segment.contains("..") || segment.contains('\\') {
                return Err(AppError::InvalidInput {
                    message: format!("invalid attachment path segment {segment:?}"),
                });
            }
        }
        if message_id.contains('/') || file_name.contains('/') {
            return Err(AppError::InvalidInput {
                message: format!("invalid attachment key {message_id}/{file_name}"),
            });
        }
        Ok(self.root.join(base_path).join(message_id).join(file_name))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(&self, base_path: &str, message_id: &str, file_name: &str) -> Result<Vec<u8>, AppError> {
        let path = self.path_for(base_path, message_id, file_name)?;
        tokio::fs::read(&path).await.map_err(|e| {
            error!("Failed to read attachment {}: {e}", path.display());
            AppError::MissingAttachment { path: format!("{base_path}/{message_id}/{file_name}") }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_blob_under_owning_message() {
        let root = std::env::temp_dir().join(format!("chat-relay-blobs-{}", crate::models::new_id()));
        tokio::fs::create_dir_all(root.join("messages").join("m1")).await.unwrap();
        tokio::fs::write(root.join("messages").join("m1").join("a.png"), b"png-bytes")
            .await
            .unwrap();

        let store = FsBlobStore::new(&root);
        let bytes = store.read("messages", "m1", "a.png").await.unwrap();
        assert_eq!(bytes, b"png-bytes");

        let missing = store.read("messages", "m2", "a.png").await.unwrap_err();
        assert!(matches!(missing, AppError::MissingAttachment { .. }));

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let store = FsBlobStore::new("/tmp");
        let err = store.read("messages", "..", "passwd").await.unwrap_err();
        assert!(err.is_validation());
    }
}
