//! In-memory registry used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use registry_migrator::error::{RegistryError, Result};
use registry_migrator::image::media_types::{
    DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, OCI_CONFIG, OCI_INDEX, OCI_MANIFEST,
};
use registry_migrator::image::DigestUtils;
use registry_migrator::registry::{BlobStream, RegistryApi, RemoteDescriptor};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct StoredManifest {
    pub media_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestPush {
    pub repository: String,
    pub reference: String,
    pub media_type: String,
    pub digest: String,
}

#[derive(Default)]
struct State {
    manifests: HashMap<(String, String), StoredManifest>,
    blobs: HashMap<(String, String), Bytes>,
    tags: BTreeMap<String, Vec<String>>,
    manifest_pushes: Vec<ManifestPush>,
    blob_uploads: Vec<String>,
    failing_tags: HashSet<String>,
    unreadable_blobs: HashSet<String>,
    manifest_fetches: usize,
}

/// Fake registry keyed by repository
pub struct FakeRegistry {
    host: String,
    state: Mutex<State>,
}

impl FakeRegistry {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_blob(&self, repository: &str, data: &[u8]) -> String {
        let digest = DigestUtils::compute_docker_digest(data);
        self.state().blobs.insert(
            (repository.to_string(), digest.clone()),
            Bytes::copy_from_slice(data),
        );
        digest
    }

    /// Store a manifest under its digest and, when given, a tag
    pub fn add_manifest(&self, repository: &str, tag: Option<&str>, media_type: &str, data: Vec<u8>) -> String {
        let digest = DigestUtils::compute_docker_digest(&data);
        let stored = StoredManifest {
            media_type: media_type.to_string(),
            data,
        };
        let mut state = self.state();
        state
            .manifests
            .insert((repository.to_string(), digest.clone()), stored.clone());
        if let Some(tag) = tag {
            state
                .manifests
                .insert((repository.to_string(), tag.to_string()), stored);
            let tags = state.tags.entry(repository.to_string()).or_default();
            if !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
        digest
    }

    /// Store a single-platform image and return its manifest descriptor JSON
    pub fn add_image(
        &self,
        repository: &str,
        tag: Option<&str>,
        os: &str,
        architecture: &str,
        layers: &[&[u8]],
    ) -> serde_json::Value {
        let config = json!({
            "architecture": architecture,
            "os": os,
            "created": "2024-05-01T12:00:00Z",
            "rootfs": {"type": "layers", "diff_ids": []}
        });
        let config_bytes = serde_json::to_vec(&config).unwrap();
        let config_digest = self.add_blob(repository, &config_bytes);

        let layer_descriptors: Vec<_> = layers
            .iter()
            .map(|layer| {
                let digest = self.add_blob(repository, layer);
                json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": digest,
                    "size": layer.len()
                })
            })
            .collect();

        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {"mediaType": OCI_CONFIG, "digest": config_digest, "size": config_bytes.len()},
            "layers": layer_descriptors
        });
        let data = serde_json::to_vec(&manifest).unwrap();
        let size = data.len();
        let digest = self.add_manifest(repository, tag, OCI_MANIFEST, data);
        json!({
            "mediaType": OCI_MANIFEST,
            "digest": digest,
            "size": size,
            "platform": {"os": os, "architecture": architecture}
        })
    }

    /// Store an index over the given child descriptors
    pub fn add_index(&self, repository: &str, tag: &str, children: Vec<serde_json::Value>) -> String {
        let index = json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": children
        });
        self.add_manifest(repository, Some(tag), OCI_INDEX, serde_json::to_vec(&index).unwrap())
    }

    /// Attestation-style child with an `unknown/unknown` platform
    pub fn add_attestation(&self, repository: &str) -> serde_json::Value {
        let mut descriptor = self.add_image(repository, None, "unknown", "unknown", &[b"attestation"]);
        descriptor["annotations"] = json!({"vnd.docker.reference.type": "attestation-manifest"});
        descriptor
    }

    pub fn fail_tag(&self, tag: &str) {
        self.state().failing_tags.insert(tag.to_string());
    }

    pub fn make_blob_unreadable(&self, digest: &str) {
        self.state().unreadable_blobs.insert(digest.to_string());
    }

    pub fn manifest_pushes(&self) -> Vec<ManifestPush> {
        self.state().manifest_pushes.clone()
    }

    pub fn blob_uploads(&self) -> Vec<String> {
        self.state().blob_uploads.clone()
    }

    pub fn manifest(&self, repository: &str, reference: &str) -> Option<StoredManifest> {
        self.state()
            .manifests
            .get(&(repository.to_string(), reference.to_string()))
            .cloned()
    }

    pub fn blob(&self, repository: &str, digest: &str) -> Option<Bytes> {
        self.state()
            .blobs
            .get(&(repository.to_string(), digest.to_string()))
            .cloned()
    }

    pub fn has_blob(&self, repository: &str, digest: &str) -> bool {
        self.state()
            .blobs
            .contains_key(&(repository.to_string(), digest.to_string()))
    }

    pub fn manifest_fetches(&self) -> usize {
        self.state().manifest_fetches
    }
}

#[async_trait]
impl RegistryApi for FakeRegistry {
    fn host(&self) -> &str {
        &self.host
    }

    async fn list_repositories(&self, _cancel: &CancellationToken) -> Result<Vec<String>> {
        Ok(self.state().tags.keys().cloned().collect())
    }

    async fn list_tags(&self, repository: &str, _cancel: &CancellationToken) -> Result<Vec<String>> {
        self.state()
            .tags
            .get(repository)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("repository {}", repository)))
    }

    async fn get_descriptor(
        &self,
        repository: &str,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteDescriptor> {
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        let mut state = self.state();
        state.manifest_fetches += 1;
        if state.failing_tags.contains(reference) {
            return Err(RegistryError::Registry {
                status: 500,
                message: format!("manifest fetch for {}:{} failed", repository, reference),
            });
        }
        let stored = state
            .manifests
            .get(&(repository.to_string(), reference.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("manifest {}:{}", repository, reference)))?;
        let digest = DigestUtils::compute_docker_digest(&stored.data);
        Ok(RemoteDescriptor::new(
            Some(stored.media_type.as_str()),
            Some(digest.as_str()),
            stored.data,
        ))
    }

    async fn blob_exists(&self, repository: &str, digest: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(self.has_blob(repository, digest))
    }

    async fn get_blob(&self, repository: &str, digest: &str, cancel: &CancellationToken) -> Result<BlobStream> {
        if cancel.is_cancelled() {
            return Err(RegistryError::Cancelled);
        }
        let state = self.state();
        if state.unreadable_blobs.contains(digest) {
            return Err(RegistryError::Registry {
                status: 500,
                message: format!("blob {} unavailable", digest),
            });
        }
        let data = state
            .blobs
            .get(&(repository.to_string(), digest.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("blob {}", digest)))?;
        // two chunks to exercise progress accounting
        let split = data.len() / 2;
        let chunks = vec![Ok(data.slice(..split)), Ok(data.slice(split..))];
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn put_blob(
        &self,
        repository: &str,
        digest: &str,
        size: u64,
        mut data: BlobStream,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let mut collected = Vec::new();
        while let Some(chunk) = data.next().await {
            collected.extend_from_slice(&chunk?);
        }
        if collected.len() as u64 != size {
            return Err(RegistryError::Registry {
                status: 400,
                message: "size mismatch".to_string(),
            });
        }
        DigestUtils::verify(&collected, digest)?;
        let mut state = self.state();
        state.blob_uploads.push(digest.to_string());
        state
            .blobs
            .insert((repository.to_string(), digest.to_string()), Bytes::from(collected));
        Ok(())
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        data: Vec<u8>,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        let digest = DigestUtils::compute_docker_digest(&data);
        if DigestUtils::is_digest_reference(reference) && reference != digest {
            return Err(RegistryError::Registry {
                status: 400,
                message: "digest does not match manifest".to_string(),
            });
        }
        self.state().manifest_pushes.push(ManifestPush {
            repository: repository.to_string(),
            reference: reference.to_string(),
            media_type: media_type.to_string(),
            digest: digest.clone(),
        });
        let tag = (!DigestUtils::is_digest_reference(reference)).then_some(reference);
        self.add_manifest(repository, tag, media_type, data);
        Ok(digest)
    }
}

/// Media types re-exported for test readability
pub const INDEX_TYPE: &str = OCI_INDEX;
pub const LEGACY_LIST_TYPE: &str = DOCKER_MANIFEST_LIST;
pub const LEGACY_IMAGE_TYPE: &str = DOCKER_MANIFEST;
