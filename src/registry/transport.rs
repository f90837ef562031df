//! Registry transport abstraction
//!
//! [`RegistryApi`] is the set of Docker Registry v2 / OCI distribution calls the
//! copy engine and tag enumeration need. [`crate::registry::RegistryClient`]
//! implements it over HTTP; tests implement it in memory.

use crate::error::{RegistryError, Result};
use crate::image::digest::DigestUtils;
use crate::image::manifest::{detect_kind, ImageConfig};
use crate::image::media_types::ManifestKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Streamed blob content
pub type BlobStream = BoxStream<'static, Result<Bytes>>;

/// A fetched manifest: its bytes plus the identity the registry reported
#[derive(Debug, Clone)]
pub struct RemoteDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    pub data: Vec<u8>,
}

impl RemoteDescriptor {
    /// Build from response parts; the digest falls back to the body hash
    pub fn new(content_type: Option<&str>, digest: Option<&str>, data: Vec<u8>) -> Self {
        let digest = digest
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| DigestUtils::compute_docker_digest(&data));
        Self {
            media_type: content_type.unwrap_or_default().to_string(),
            digest,
            size: data.len() as u64,
            data,
        }
    }

    pub fn kind(&self) -> Result<ManifestKind> {
        let content_type = Some(self.media_type.as_str()).filter(|m| !m.is_empty());
        detect_kind(content_type, &self.data)
    }
}

#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Normalized host this client talks to
    fn host(&self) -> &str;

    /// All repository names from the catalog, across pages
    async fn list_repositories(&self, cancel: &CancellationToken) -> Result<Vec<String>>;

    /// All tags of a repository, across pages
    async fn list_tags(&self, repository: &str, cancel: &CancellationToken) -> Result<Vec<String>>;

    /// Fetch a manifest or index by tag or digest
    async fn get_descriptor(
        &self,
        repository: &str,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteDescriptor>;

    async fn blob_exists(
        &self,
        repository: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    async fn get_blob(
        &self,
        repository: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<BlobStream>;

    /// Upload a blob of known digest and size
    async fn put_blob(
        &self,
        repository: &str,
        digest: &str,
        size: u64,
        data: BlobStream,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Upload a manifest or index under a tag or digest; returns the stored digest
    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Fetch a whole blob into memory and verify it against its digest
    async fn read_blob(
        &self,
        repository: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut stream = self.get_blob(repository, digest, cancel).await?;
        let mut data = Vec::new();
        while let Some(chunk) = cancellable(cancel, async { stream.next().await.transpose() }).await? {
            data.extend_from_slice(&chunk);
        }
        DigestUtils::verify(&data, digest)?;
        Ok(data)
    }

    async fn read_config(
        &self,
        repository: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<ImageConfig> {
        let data = self.read_blob(repository, digest, cancel).await?;
        ImageConfig::from_slice(&data)
    }
}

/// Run a future unless the token fires first
pub async fn cancellable<T, F>(cancel: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RegistryError::Cancelled),
        result = future => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_token_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = cancellable(&cancel, std::future::pending()).await;
        assert!(matches!(result, Err(RegistryError::Cancelled)));
    }

    #[test]
    fn descriptor_digest_falls_back_to_body_hash() {
        let body = br#"{"schemaVersion":2,"manifests":[]}"#.to_vec();
        let descriptor = RemoteDescriptor::new(None, None, body.clone());
        assert_eq!(descriptor.digest, DigestUtils::compute_docker_digest(&body));
        assert_eq!(descriptor.kind().unwrap(), ManifestKind::Index);
    }
}
