//! Platform descriptions and architecture filter matching
//!
//! Filter tokens match by substring, against the architecture alone or against
//! `os/arch`. The rule is intentionally loose: `arm64` matches an `arm64` manifest
//! with variant `v8`, and a token like `64` matches both `amd64` and `arm64`.
//! Descriptors without a usable platform never match.

use crate::image::manifest::Descriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Architecture value registries use for attestation and other non-runnable entries
pub const UNKNOWN_ARCHITECTURE: &str = "unknown";

/// Default architectures applied to image list entries without an `#arch=` directive
pub const DEFAULT_ARCHITECTURES: &[&str] = &["amd64", "arm64"];

/// Platform information for a manifest
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Platform {
    pub fn new(os: &str, architecture: &str, variant: Option<&str>) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            variant: variant.map(str::to_string),
            ..Default::default()
        }
    }

    /// False for empty or `unknown` architectures
    pub fn is_known(&self) -> bool {
        !self.architecture.is_empty() && self.architecture != UNKNOWN_ARCHITECTURE
    }

    pub fn os_arch(&self) -> String {
        format!("{}/{}", self.os, self.architecture)
    }

    /// Substring match of one filter token against `arch` or `os/arch`
    pub fn matches(&self, token: &str) -> bool {
        self.is_known() && (self.architecture.contains(token) || self.os_arch().contains(token))
    }

    pub fn matches_any<S: AsRef<str>>(&self, tokens: &[S]) -> bool {
        tokens.iter().any(|token| self.matches(token.as_ref()))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = self.variant.as_deref().filter(|v| !v.is_empty()) {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Keep the descriptors whose platform matches any token, in index order
pub fn select_descriptors<S: AsRef<str>>(manifests: &[Descriptor], tokens: &[S]) -> Vec<Descriptor> {
    manifests
        .iter()
        .filter(|descriptor| {
            descriptor
                .platform
                .as_ref()
                .is_some_and(|platform| platform.matches_any(tokens))
        })
        .cloned()
        .collect()
}

pub fn default_architectures() -> Vec<String> {
    DEFAULT_ARCHITECTURES.iter().map(|a| a.to_string()).collect()
}
