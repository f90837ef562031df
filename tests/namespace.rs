use async_trait::async_trait;
use registry_migrator::error::{RegistryError, Result};
use registry_migrator::logging::Logger;
use registry_migrator::namespace::{NamespaceCheckedSet, NamespaceProvisioner, ProjectApi};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Project API that counts calls
#[derive(Default)]
struct FakeProjects {
    existing: Mutex<HashSet<String>>,
    lookups: AtomicUsize,
    creates: AtomicUsize,
    failures_left: AtomicUsize,
    tls_rejected: AtomicBool,
    plaintext: AtomicBool,
    downgrades: AtomicUsize,
}

impl FakeProjects {
    fn with_existing(names: &[&str]) -> Self {
        let projects = Self::default();
        projects
            .existing
            .lock()
            .unwrap()
            .extend(names.iter().map(|n| n.to_string()));
        projects
    }
}

#[async_trait]
impl ProjectApi for FakeProjects {
    async fn project_exists(&self, name: &str, _cancel: &CancellationToken) -> Result<bool> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.tls_rejected.load(Ordering::SeqCst) && !self.plaintext.load(Ordering::SeqCst) {
            return Err(RegistryError::SchemeMismatch(
                "server gave HTTP response to HTTPS client".to_string(),
            ));
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RegistryError::Transport("connection reset".to_string()));
        }
        Ok(self.existing.lock().unwrap().contains(name))
    }

    async fn create_project(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.existing.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    fn downgrade_to_plaintext(&self) -> bool {
        self.downgrades.fetch_add(1, Ordering::SeqCst);
        !self.plaintext.swap(true, Ordering::SeqCst)
    }
}

fn provisioner(api: &Arc<FakeProjects>) -> (NamespaceProvisioner, Arc<NamespaceCheckedSet>) {
    let checked = Arc::new(NamespaceCheckedSet::new());
    let provisioner = NamespaceProvisioner::new(api.clone(), checked.clone(), Logger::new_quiet());
    (provisioner, checked)
}

#[tokio::test]
async fn missing_namespace_is_created_once() {
    let api = Arc::new(FakeProjects::default());
    let (provisioner, checked) = provisioner(&api);
    let cancel = CancellationToken::new();

    provisioner.ensure("team", &cancel).await.unwrap();
    provisioner.ensure_for_repository("team/app", &cancel).await.unwrap();
    provisioner.ensure_for_repository("team/other", &cancel).await.unwrap();

    assert_eq!(api.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(api.creates.load(Ordering::SeqCst), 1);

    // a second provisioner sharing the set does not look again
    let again = NamespaceProvisioner::new(api.clone(), checked, Logger::new_quiet());
    again.ensure("team", &cancel).await.unwrap();
    assert_eq!(api.lookups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn existing_namespace_is_not_created() {
    let api = Arc::new(FakeProjects::with_existing(&["library"]));
    let (provisioner, _) = provisioner(&api);

    provisioner
        .ensure_for_repository("library/nginx", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(api.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_ensure_is_retried_later() {
    let api = Arc::new(FakeProjects::default());
    api.failures_left.store(1, Ordering::SeqCst);
    let (provisioner, checked) = provisioner(&api);
    let cancel = CancellationToken::new();

    assert!(provisioner.ensure("team", &cancel).await.is_err());

    provisioner.ensure("team", &cancel).await.unwrap();
    assert_eq!(api.lookups.load(Ordering::SeqCst), 2);
    assert_eq!(api.creates.load(Ordering::SeqCst), 1);

    let again = NamespaceProvisioner::new(api.clone(), checked, Logger::new_quiet());
    again.ensure("team", &cancel).await.unwrap();
    assert_eq!(api.lookups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn plaintext_server_triggers_one_downgrade() {
    let api = Arc::new(FakeProjects::default());
    api.tls_rejected.store(true, Ordering::SeqCst);
    let (provisioner, _) = provisioner(&api);
    let cancel = CancellationToken::new();

    provisioner.ensure("team", &cancel).await.unwrap();
    provisioner.ensure("ops", &cancel).await.unwrap();

    assert_eq!(api.downgrades.load(Ordering::SeqCst), 1);
    assert_eq!(api.creates.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn repositories_without_namespace_are_ignored() {
    let api = Arc::new(FakeProjects::default());
    let (provisioner, _) = provisioner(&api);

    provisioner
        .ensure_for_repository("nginx", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(api.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_callers_share_one_check() {
    let api = Arc::new(FakeProjects::default());
    let (provisioner, _) = provisioner(&api);
    let provisioner = Arc::new(provisioner);
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let provisioner = Arc::clone(&provisioner);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            provisioner.ensure("team", &cancel).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(api.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(api.creates.load(Ordering::SeqCst), 1);
}
