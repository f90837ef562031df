//! Manifest, index and config documents
//!
//! Unknown fields are carried through `extra` so a re-serialized document keeps
//! everything the registry sent, apart from the fields we rewrite.

use crate::error::{RegistryError, Result};
use crate::image::media_types::{self, ManifestKind};
use crate::image::platform::Platform;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Content descriptor referencing a blob or a child manifest
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Single-platform image manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ImageManifest {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| RegistryError::Parse(format!("Invalid image manifest: {}", e)))
    }

    /// Config first, then layers, in manifest order
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }

    pub fn layer_size(&self) -> u64 {
        self.layers.iter().map(|layer| layer.size).sum()
    }
}

/// Multi-platform manifest list or OCI image index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ImageIndex {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| RegistryError::Parse(format!("Invalid image index: {}", e)))
    }

    /// Copy of this index holding only the given descriptors
    pub fn with_manifests(&self, manifests: Vec<Descriptor>) -> Self {
        Self {
            manifests,
            ..self.clone()
        }
    }
}

/// The parts of an image config blob this tool reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
}

impl ImageConfig {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| RegistryError::Parse(format!("Invalid image config: {}", e)))
    }

    pub fn platform(&self) -> Platform {
        Platform::new(&self.os, &self.architecture, self.variant.as_deref())
    }

    /// Creation time, `None` when absent, unparsable or the zero timestamp
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.created.as_deref()?;
        let parsed = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);
        (parsed.year() > 1).then_some(parsed)
    }
}

/// Decide whether a fetched manifest is an index or an image.
///
/// The response content type wins; otherwise the body's own `mediaType`, then
/// its shape.
pub fn detect_kind(content_type: Option<&str>, body: &[u8]) -> Result<ManifestKind> {
    if let Some(kind) = content_type.and_then(ManifestKind::from_media_type) {
        return Ok(kind);
    }

    let document: Value = serde_json::from_slice(body)
        .map_err(|e| RegistryError::Parse(format!("Manifest is not valid JSON: {}", e)))?;

    if let Some(media_type) = document.get("mediaType").and_then(Value::as_str) {
        if let Some(kind) = ManifestKind::from_media_type(media_type) {
            return Ok(kind);
        }
    }

    if content_type.is_some_and(media_types::is_legacy_schema1)
        || document.get("schemaVersion").and_then(Value::as_u64) == Some(1)
    {
        return Err(RegistryError::Parse(
            "Schema 1 manifests are not supported".to_string(),
        ));
    }

    if document.get("manifests").is_some_and(Value::is_array) {
        Ok(ManifestKind::Index)
    } else if document.get("config").is_some() && document.get("layers").is_some() {
        Ok(ManifestKind::Image)
    } else {
        Err(RegistryError::Parse(
            "Unrecognized manifest document".to_string(),
        ))
    }
}

/// Media type to send when pushing a manifest whose document omits one
pub fn effective_media_type(declared: Option<&str>, kind: ManifestKind) -> String {
    match declared {
        Some(media_type) if !media_type.is_empty() => media_type.to_string(),
        _ => match kind {
            ManifestKind::Index => media_types::OCI_INDEX.to_string(),
            ManifestKind::Image => media_types::OCI_MANIFEST.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [
            {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:aa", "size": 10,
             "platform": {"architecture": "amd64", "os": "linux"}},
            {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:bb", "size": 11,
             "platform": {"architecture": "unknown", "os": "unknown"},
             "annotations": {"vnd.docker.reference.type": "attestation-manifest"}}
        ],
        "annotations": {"org.opencontainers.image.source": "https://example.com"},
        "subject": {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:cc", "size": 3}
    }"#;

    #[test]
    fn index_keeps_unknown_fields_when_filtered() {
        let index = ImageIndex::from_slice(INDEX.as_bytes()).unwrap();
        let kept = vec![index.manifests[0].clone()];
        let filtered = index.with_manifests(kept);

        let value: Value = serde_json::to_value(&filtered).unwrap();
        assert_eq!(value["manifests"].as_array().unwrap().len(), 1);
        assert_eq!(value["subject"]["digest"], "sha256:cc");
        assert_eq!(
            value["annotations"]["org.opencontainers.image.source"],
            "https://example.com"
        );
        assert_eq!(value["mediaType"], media_types::OCI_INDEX);
    }

    #[test]
    fn detects_kind_from_body_when_header_is_generic() {
        let kind = detect_kind(Some("application/json"), INDEX.as_bytes()).unwrap();
        assert_eq!(kind, ManifestKind::Index);

        let image = br#"{"schemaVersion":2,"config":{"digest":"sha256:c","size":1},"layers":[]}"#;
        assert_eq!(detect_kind(None, image).unwrap(), ManifestKind::Image);

        let legacy = br#"{"schemaVersion":1,"name":"x","fsLayers":[]}"#;
        assert!(detect_kind(None, legacy).is_err());
    }

    #[test]
    fn zero_created_time_is_ignored() {
        let config = ImageConfig::from_slice(
            br#"{"architecture":"amd64","os":"linux","created":"0001-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(config.created_at().is_none());

        let config = ImageConfig::from_slice(
            br#"{"architecture":"arm64","os":"linux","variant":"v8","created":"2024-03-01T10:00:00.123Z"}"#,
        )
        .unwrap();
        assert_eq!(config.created_at().unwrap().year(), 2024);
        assert_eq!(config.platform().to_string(), "linux/arm64/v8");
    }
}
