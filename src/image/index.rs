//! Index objects the copy engine can push
//!
//! [`RemoteIndex`] is an index exactly as the source registry served it.
//! [`FilteredIndex`] reads through a source index but exposes only the selected
//! child descriptors; its serialized form, digest and size are derived from that
//! reduced document, never from the source bytes.

use crate::error::{RegistryError, Result};
use crate::image::digest::DigestUtils;
use crate::image::manifest::{effective_media_type, Descriptor, ImageIndex};
use crate::image::media_types::{self, ManifestKind};
use crate::registry::transport::{RegistryApi, RemoteDescriptor};
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

/// An index document ready to be written to a registry
pub trait Index: Send + Sync {
    fn media_type(&self) -> &str;

    fn manifests(&self) -> &[Descriptor];

    /// Exact bytes to upload
    fn raw_manifest(&self) -> Result<&[u8]>;

    fn digest(&self) -> Result<String> {
        Ok(DigestUtils::compute_docker_digest(self.raw_manifest()?))
    }

    fn size(&self) -> Result<u64> {
        Ok(self.raw_manifest()?.len() as u64)
    }
}

/// Fetch the manifest a child descriptor points at, by digest.
///
/// When the registry reports no content type the descriptor's media type is
/// used instead.
pub async fn resolve_child(
    client: &dyn RegistryApi,
    repository: &str,
    child: &Descriptor,
    cancel: &CancellationToken,
) -> Result<RemoteDescriptor> {
    let mut fetched = client.get_descriptor(repository, &child.digest, cancel).await?;
    if fetched.media_type.is_empty() {
        fetched.media_type = child.media_type.clone();
    }
    Ok(fetched)
}

/// Index fetched from a registry, kept byte-for-byte
#[derive(Debug, Clone)]
pub struct RemoteIndex {
    media_type: String,
    digest: String,
    raw: Vec<u8>,
    document: ImageIndex,
}

impl RemoteIndex {
    /// Parse fetched index bytes. `media_type` is the type the registry reported.
    pub fn new(media_type: &str, raw: Vec<u8>) -> Result<Self> {
        let document = ImageIndex::from_slice(&raw)?;
        let media_type = if media_types::is_index(media_type) {
            media_types::base_media_type(media_type).to_string()
        } else {
            effective_media_type(document.media_type.as_deref(), ManifestKind::Index)
        };
        let digest = DigestUtils::compute_docker_digest(&raw);
        Ok(Self {
            media_type,
            digest,
            raw,
            document,
        })
    }

    pub fn document(&self) -> &ImageIndex {
        &self.document
    }
}

impl Index for RemoteIndex {
    fn media_type(&self) -> &str {
        &self.media_type
    }

    fn manifests(&self) -> &[Descriptor] {
        &self.document.manifests
    }

    fn raw_manifest(&self) -> Result<&[u8]> {
        Ok(&self.raw)
    }

    fn digest(&self) -> Result<String> {
        Ok(self.digest.clone())
    }
}

/// Read-through view of a source index restricted to selected children
#[derive(Debug)]
pub struct FilteredIndex<'a> {
    source: &'a RemoteIndex,
    kept: Vec<Descriptor>,
    raw: OnceLock<Vec<u8>>,
}

impl<'a> FilteredIndex<'a> {
    /// `kept` must be a non-empty subset of the source's descriptors
    pub fn new(source: &'a RemoteIndex, kept: Vec<Descriptor>) -> Result<Self> {
        if kept.is_empty() {
            return Err(RegistryError::Parse(
                "Filtered index must keep at least one manifest".to_string(),
            ));
        }
        Ok(Self {
            source,
            kept,
            raw: OnceLock::new(),
        })
    }

    pub fn source_digest(&self) -> &str {
        &self.source.digest
    }
}

impl Index for FilteredIndex<'_> {
    // media type is the source's, never the child's
    fn media_type(&self) -> &str {
        self.source.media_type()
    }

    fn manifests(&self) -> &[Descriptor] {
        &self.kept
    }

    fn raw_manifest(&self) -> Result<&[u8]> {
        if let Some(raw) = self.raw.get() {
            return Ok(raw);
        }
        let document = self.source.document().with_manifests(self.kept.clone());
        let encoded = serde_json::to_vec(&document)?;
        Ok(self.raw.get_or_init(|| encoded))
    }
}
