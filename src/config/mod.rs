//! Migration plan document
//!
//! The plan names the registries involved and the images to move. It is read
//! from YAML, or JSON when the file name ends in `.json`, and validated before
//! any network activity.

pub mod reference;
pub mod resolve;

use crate::error::{RegistryError, Result};
use crate::image::platform::default_architectures;
use crate::registry::endpoint::{
    normalize_host, Credentials, ProxySettings, RegistryEndpoint, DOCKER_HUB,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub use reference::{Identifier, ImageReference};
pub use resolve::{resolve, MigrationTask};

/// Connection information for one registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    /// Registry flavour; `harbor` enables namespace provisioning
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl RegistryConfig {
    pub fn is_harbor(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case("harbor"))
    }

    pub fn endpoint(&self) -> RegistryEndpoint {
        RegistryEndpoint::new(&self.registry)
            .with_credentials(Credentials::from_parts(
                self.username.as_deref(),
                self.password.as_deref(),
            ))
            .with_insecure(self.insecure)
    }
}

/// One explicitly configured image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Source registry; taken from `name` or the default source when empty
    #[serde(default)]
    pub registry: Option<String>,
    pub name: String,
    #[serde(default)]
    pub target_name: Option<String>,
    /// Empty means every tag of the source repository
    #[serde(default)]
    pub tags: Vec<String>,
    /// Empty means no filtering
    #[serde(default)]
    pub architectures: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    #[serde(default)]
    pub source_registries: BTreeMap<String, RegistryConfig>,
    #[serde(default)]
    pub destination_registries: BTreeMap<String, RegistryConfig>,
    #[serde(default)]
    pub default_source: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub no_proxy: Option<String>,
    #[serde(default)]
    pub default_architectures: Option<Vec<String>>,
    #[serde(default)]
    pub images: Vec<ImageEntry>,
    #[serde(default)]
    pub image_list: String,
}

impl MigrationPlan {
    /// Load and validate a plan file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RegistryError::Config(format!("Cannot read plan file {}: {}", path.display(), e))
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let plan = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };
        Ok(plan)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut plan: Self = serde_yaml::from_str(content)?;
        plan.normalize();
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let mut plan: Self = serde_json::from_str(content)
            .map_err(|e| RegistryError::Config(format!("Invalid plan document: {}", e)))?;
        plan.normalize();
        plan.validate()?;
        Ok(plan)
    }

    /// Fill empty `registry` fields from their map keys
    fn normalize(&mut self) {
        for (key, registry) in self
            .source_registries
            .iter_mut()
            .chain(self.destination_registries.iter_mut())
        {
            if registry.registry.trim().is_empty() {
                registry.registry = key.clone();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.destination_registries.len() {
            0 => {
                return Err(RegistryError::Config(
                    "destination_registries must name a destination registry".to_string(),
                ))
            }
            1 => {}
            n => {
                return Err(RegistryError::Config(format!(
                    "destination_registries must name exactly one registry, found {}",
                    n
                )))
            }
        }

        for (key, registry) in self
            .source_registries
            .iter()
            .chain(self.destination_registries.iter())
        {
            if normalize_host(&registry.registry).0.is_empty() {
                return Err(RegistryError::Config(format!(
                    "Registry entry '{}' has no host",
                    key
                )));
            }
        }

        for (position, image) in self.images.iter().enumerate() {
            if image.name.trim().is_empty() {
                return Err(RegistryError::Config(format!(
                    "images[{}] has an empty name",
                    position
                )));
            }
        }
        Ok(())
    }

    /// The single destination registry
    pub fn destination(&self) -> Result<&RegistryConfig> {
        self.destination_registries
            .values()
            .next()
            .ok_or_else(|| RegistryError::Config("No destination registry configured".to_string()))
    }

    pub fn default_source(&self) -> String {
        self.default_source
            .as_deref()
            .map(|source| normalize_host(source).0)
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| DOCKER_HUB.to_string())
    }

    pub fn default_architectures(&self) -> Vec<String> {
        match &self.default_architectures {
            Some(archs) if !archs.is_empty() => archs.clone(),
            _ => default_architectures(),
        }
    }

    /// Credentials and TLS settings of every configured registry
    pub fn endpoints(&self) -> Vec<RegistryEndpoint> {
        self.source_registries
            .values()
            .chain(self.destination_registries.values())
            .map(RegistryConfig::endpoint)
            .collect()
    }

    /// Proxy settings, command line values taking precedence over the plan
    pub fn proxy_settings(
        &self,
        proxy_override: Option<&str>,
        no_proxy_override: Option<&str>,
    ) -> Result<ProxySettings> {
        ProxySettings::new(
            proxy_override.or(self.proxy.as_deref()),
            no_proxy_override.or(self.no_proxy.as_deref()),
        )
    }

    /// Migration tasks in execution order
    pub fn tasks(&self) -> Result<Vec<MigrationTask>> {
        resolve(
            &self.images,
            &self.image_list,
            &self.default_architectures(),
            &self.default_source(),
        )
    }
}
