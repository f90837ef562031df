//! Registry Migrator Library
//!
//! Copies container images between Docker Registry v2 / OCI distribution
//! registries, optionally keeping only selected architectures of multi-platform
//! images, and provisions destination namespaces on Harbor.

pub mod cli;
pub mod config;
pub mod copy;
pub mod error;
pub mod image;
pub mod logging;
pub mod namespace;
pub mod registry;
pub mod tags;

pub use error::{RegistryError, Result};
pub use logging::Logger;
