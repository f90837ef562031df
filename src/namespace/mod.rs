//! Destination namespace provisioning
//!
//! Registries like Harbor reject pushes into a project that does not exist.
//! [`NamespaceProvisioner::ensure`] checks for the namespace and creates it when
//! missing. Successful outcomes are remembered in a [`NamespaceCheckedSet`]
//! shared by the whole run, so each namespace is ensured at most once.

pub mod harbor;

use crate::error::{ErrorKind, Result};
use crate::logging::Logger;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub use harbor::HarborClient;

/// Project management calls of a registry
#[async_trait]
pub trait ProjectApi: Send + Sync {
    async fn project_exists(&self, name: &str, cancel: &CancellationToken) -> Result<bool>;

    /// Create a project; an already existing project is not an error
    async fn create_project(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    /// Switch to plaintext HTTP. Returns false if already switched or not allowed.
    fn downgrade_to_plaintext(&self) -> bool;
}

/// Namespaces already ensured during this run
#[derive(Debug, Default)]
pub struct NamespaceCheckedSet {
    checked: Mutex<HashMap<String, bool>>,
}

impl NamespaceCheckedSet {
    pub fn new() -> Self {
        Self::default()
    }
}

/// First path segment of a repository, if it has more than one
pub fn namespace_of(repository: &str) -> Option<&str> {
    let (namespace, rest) = repository.split_once('/')?;
    (!namespace.is_empty() && !rest.is_empty()).then_some(namespace)
}

pub struct NamespaceProvisioner {
    api: Arc<dyn ProjectApi>,
    checked: Arc<NamespaceCheckedSet>,
    logger: Logger,
}

impl NamespaceProvisioner {
    pub fn new(api: Arc<dyn ProjectApi>, checked: Arc<NamespaceCheckedSet>, logger: Logger) -> Self {
        Self {
            api,
            checked,
            logger,
        }
    }

    /// Make sure `namespace` exists on the destination.
    ///
    /// Concurrent callers are serialized; a namespace that was ensured once is
    /// not checked again. Failures are not remembered.
    pub async fn ensure(&self, namespace: &str, cancel: &CancellationToken) -> Result<()> {
        let mut checked = self.checked.checked.lock().await;
        if checked.get(namespace).copied().unwrap_or(false) {
            return Ok(());
        }

        let exists = match self.api.project_exists(namespace, cancel).await {
            Err(err) if err.kind() == ErrorKind::SchemeMismatch && self.api.downgrade_to_plaintext() => {
                self.logger.warning(&format!(
                    "Project API answered in plaintext, retrying {} over http",
                    namespace
                ));
                self.api.project_exists(namespace, cancel).await?
            }
            other => other?,
        };

        if exists {
            self.logger
                .detail(&format!("Namespace {} already exists", namespace));
        } else {
            self.logger
                .step(&format!("Creating namespace {}", namespace));
            self.api.create_project(namespace, cancel).await?;
            self.logger
                .success(&format!("Namespace {} is ready", namespace));
        }

        checked.insert(namespace.to_string(), true);
        Ok(())
    }

    /// Ensure the namespace of `repository`, if it has one
    pub async fn ensure_for_repository(
        &self,
        repository: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match namespace_of(repository) {
            Some(namespace) => self.ensure(namespace, cancel).await,
            None => Ok(()),
        }
    }
}
