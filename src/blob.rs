//! Blob store collaborator: artifact bytes in, public URL out. Each call
//! mints a fresh timestamp-derived name; overwrite-if-exists semantics.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tracing::{info, instrument};

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: &[u8], content_type: &str) -> Result<String>;
}

/// Filesystem-backed store serving blobs from the data directory under a
/// configured public base URL.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "audio/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/wav" => "wav",
        _ => "dat",
    }
}

fn fresh_name(content_type: &str) -> String {
    format!(
        "{}.{}",
        Utc::now().format("%Y%m%d%H%M%S%f"),
        extension_for(content_type)
    )
}

#[async_trait]
impl BlobStore for FsBlobStore {
    #[instrument(skip_all, fields(bytes = bytes.len(), content_type = %content_type))]
    async fn put(&self, bytes: &[u8], content_type: &str) -> Result<String> {
        let name = fresh_name(content_type);
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create blob dir {}", self.root.display()))?;
        let path = self.root.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write blob {}", path.display()))?;
        info!(%name, "stored blob");
        Ok(format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            name
        ))
    }
}
