use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Blob storage: upload against a stable location reference, plus async
/// (and fallible) location-to-URL resolution.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` at `location`, overwriting any previous blob there,
    /// and returns the location reference.
    async fn put(&self, location: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    async fn download_url(&self, location: &str) -> Result<String>;
}

/// In-process blob store. Resolution produces a data URL so the result is
/// directly displayable without a server.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, (String, Vec<u8>)>>>, // location -> (content type, bytes)
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, location: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(location.to_string(), (content_type.to_string(), bytes));
        Ok(location.to_string())
    }

    async fn download_url(&self, location: &str) -> Result<String> {
        let blobs = self.blobs.read().await;
        let (content_type, bytes) = blobs
            .get(location)
            .ok_or_else(|| Error::Blob(format!("no blob at {location}")))?;
        Ok(format!("data:{content_type};base64,{}", BASE64.encode(bytes)))
    }
}
