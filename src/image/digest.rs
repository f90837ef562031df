//! SHA256 digest utilities
//!
//! Content addressing for manifests and blobs: computing `sha256:<hex>` digests
//! and checking fetched content against the digest it was requested by.

use crate::error::{RegistryError, Result};
use sha2::{Digest, Sha256};

pub const SHA256_PREFIX: &str = "sha256:";

/// Utilities for working with registry digests
pub struct DigestUtils;

impl DigestUtils {
    /// Compute SHA256 hex digest from byte data
    pub fn compute_sha256(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Compute full digest (with sha256: prefix) from byte data
    pub fn compute_docker_digest(data: &[u8]) -> String {
        format!("{}{}", SHA256_PREFIX, Self::compute_sha256(data))
    }

    /// Validate SHA256 hex string (64 characters, all hex)
    pub fn is_valid_sha256_hex(digest: &str) -> bool {
        digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Validate full digest format (sha256:xxxxx)
    pub fn is_valid_docker_digest(digest: &str) -> bool {
        digest
            .strip_prefix(SHA256_PREFIX)
            .is_some_and(Self::is_valid_sha256_hex)
    }

    /// True when a manifest reference names a digest rather than a tag
    pub fn is_digest_reference(reference: &str) -> bool {
        reference.contains(':')
    }

    /// Verify that data hashes to the expected sha256 digest.
    ///
    /// Digests of other algorithms are accepted unchecked.
    pub fn verify(data: &[u8], expected: &str) -> Result<()> {
        if !expected.starts_with(SHA256_PREFIX) {
            return Ok(());
        }
        let actual = Self::compute_docker_digest(data);
        if actual != expected {
            return Err(RegistryError::Parse(format!(
                "Digest mismatch: expected {}, computed {}",
                expected, actual
            )));
        }
        Ok(())
    }
}
