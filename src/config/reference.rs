//! Image reference grammar
//!
//! `[registry/]repository[:tag][@digest]`. The first path segment is a registry
//! host when it contains `.` or `:` or is `localhost`; otherwise the default
//! registry applies. Single-segment Docker Hub names get the `library/` prefix.

use crate::error::{RegistryError, Result};
use crate::image::digest::DigestUtils;
use crate::registry::endpoint::{normalize_host, DOCKER_HUB};
use std::fmt;

pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Tag(String),
    Digest(String),
}

impl Identifier {
    pub fn as_str(&self) -> &str {
        match self {
            Identifier::Tag(tag) => tag,
            Identifier::Digest(digest) => digest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub identifier: Option<Identifier>,
}

impl ImageReference {
    pub fn parse(input: &str, default_registry: &str) -> Result<Self> {
        Self::parse_with(input, default_registry, true)
    }

    /// Parse a name that belongs to `registry`. The first segment is never
    /// taken as a host, so `team.io/app` stays the repository.
    pub fn parse_in(input: &str, registry: &str) -> Result<Self> {
        Self::parse_with(input, registry, false)
    }

    fn parse_with(input: &str, default_registry: &str, detect_host: bool) -> Result<Self> {
        let input = input.trim();
        let invalid = |reason: &str| {
            RegistryError::Config(format!("Invalid image reference '{}': {}", input, reason))
        };
        if input.is_empty() {
            return Err(invalid("empty reference"));
        }

        let (name, digest) = match input.split_once('@') {
            Some((name, digest)) => {
                if !DigestUtils::is_valid_docker_digest(digest) {
                    return Err(invalid("malformed digest"));
                }
                (name, Some(digest))
            }
            None => (input, None),
        };

        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (&name[..last_slash + i], Some(&name[last_slash + i + 1..])),
            None => (name, None),
        };
        if let Some(tag) = tag {
            if !is_valid_tag(tag) {
                return Err(invalid("malformed tag"));
            }
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if detect_host && is_registry_host(first) => (first.to_string(), rest.to_string()),
            _ => (default_registry.to_string(), name.to_string()),
        };
        let (registry, _) = normalize_host(&registry);

        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };
        if !is_valid_repository(&repository) {
            return Err(invalid("repository must be lowercase path components of [a-z0-9._-]"));
        }

        // a digest pins the content; any tag alongside it is informational
        let identifier = match (digest, tag) {
            (Some(digest), _) => Some(Identifier::Digest(digest.to_string())),
            (None, Some(tag)) => Some(Identifier::Tag(tag.to_string())),
            (None, None) => None,
        };

        Ok(Self {
            registry,
            repository,
            identifier,
        })
    }

    /// Tag or digest, `latest` when neither was given
    pub fn identifier_or_default(&self) -> String {
        self.identifier
            .as_ref()
            .map_or_else(|| DEFAULT_TAG.to_string(), |id| id.as_str().to_string())
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.identifier {
            Some(Identifier::Tag(tag)) => write!(f, ":{}", tag),
            Some(Identifier::Digest(digest)) => write!(f, "@{}", digest),
            None => Ok(()),
        }
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    tag.len() <= 128
        && (first.is_ascii_alphanumeric() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn is_valid_repository(repository: &str) -> bool {
    !repository.is_empty()
        && repository.split('/').all(|component| {
            let bytes = component.as_bytes();
            !bytes.is_empty()
                && bytes[0].is_ascii_alphanumeric()
                && bytes[bytes.len() - 1].is_ascii_alphanumeric()
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        })
}
