//! Command execution and the migration orchestrator

use crate::cli::args::{Args, Command, RegistryArgs};
use crate::config::{MigrationPlan, MigrationTask};
use crate::copy::{progress_channel, CopyEngine, CopyRequest, ProgressTracker};
use crate::error::{ErrorKind, Result};
use crate::image::media_types::ManifestKind;
use crate::logging::Logger;
use crate::namespace::{HarborClient, NamespaceCheckedSet, NamespaceProvisioner};
use crate::registry::{
    ClientPool, Credentials, ProxySettings, RegistryApi, RegistryClient, RegistryEndpoint,
    RegistryProvider,
};
use crate::tags::{TagDetail, TagEnumerator};
use chrono::Local;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome counts of a finished command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl RunSummary {
    /// 0 when everything succeeded, 2 when any tag failed or the run was interrupted
    pub fn exit_code(&self) -> u8 {
        if self.failed > 0 || self.cancelled {
            2
        } else {
            0
        }
    }
}

pub struct Runner {
    args: Args,
    logger: Logger,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(args: Args, cancel: CancellationToken) -> Self {
        let logger = if args.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(args.verbose)
        };
        Self {
            args,
            logger,
            cancel,
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        match &self.args.command {
            Command::ListImages(registry) => self.list_images(registry).await,
            Command::ListTags { registry, repo } => self.list_tags(registry, repo).await,
            Command::Migrate { config } => self.migrate(config).await,
        }
    }

    fn proxy_settings(&self) -> Result<ProxySettings> {
        ProxySettings::new(self.args.proxy.as_deref(), self.args.no_proxy.as_deref())
    }

    fn listing_client(&self, registry: &RegistryArgs) -> Result<Arc<RegistryClient>> {
        let endpoint = RegistryEndpoint::new(&registry.registry)
            .with_credentials(Credentials::from_parts(
                registry.username.as_deref(),
                registry.password.as_deref(),
            ))
            .with_insecure(registry.insecure);
        let client = RegistryClient::new(endpoint, &self.proxy_settings()?, self.logger.clone())?;
        Ok(Arc::new(client))
    }

    async fn list_images(&self, registry: &RegistryArgs) -> Result<RunSummary> {
        let client = self.listing_client(registry)?;
        self.logger
            .step(&format!("Fetching catalog of {}", client.host()));

        let repositories = match client.list_repositories(&self.cancel).await {
            Ok(repositories) => repositories,
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                self.logger
                    .error("The registry rejected the credentials or the catalog request.");
                self.logger.info("Check the username and password.");
                self.logger.info(
                    "Harbor disables the /v2/_catalog API by default; list-tags and migrate \
                     still work, so name repositories explicitly in the plan.",
                );
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        if repositories.is_empty() {
            self.logger
                .warning("The registry is empty or the catalog is not visible to this account.");
            return Ok(RunSummary::default());
        }
        for (position, repository) in repositories.iter().enumerate() {
            println!("{:>4}  {}", position + 1, repository);
        }
        self.logger
            .success(&format!("Found {} repositories", repositories.len()));
        Ok(RunSummary {
            succeeded: repositories.len(),
            ..Default::default()
        })
    }

    async fn list_tags(&self, registry: &RegistryArgs, repository: &str) -> Result<RunSummary> {
        let client: Arc<dyn RegistryApi> = self.listing_client(registry)?;
        self.logger.step(&format!(
            "Fetching tags of {}/{}",
            client.host(),
            repository
        ));

        let enumerator = TagEnumerator::new(client, self.logger.clone());
        let mut details = enumerator.enumerate(repository, &self.cancel).await?;
        if details.is_empty() {
            self.logger.warning("The repository has no tags.");
            return Ok(RunSummary::default());
        }
        details.sort_by(|a, b| a.name.cmp(&b.name));

        for (position, detail) in details.iter().enumerate() {
            println!("{:>4}  {}", position + 1, self.format_tag(detail));
        }
        self.logger.success(&format!(
            "{} has {} tags",
            repository,
            details.len()
        ));
        Ok(RunSummary {
            succeeded: details.len(),
            ..Default::default()
        })
    }

    fn format_tag(&self, detail: &TagDetail) -> String {
        let name = if detail.name == "latest" {
            format!("{} (*)", detail.name)
        } else {
            detail.name.clone()
        };
        let architectures = if !detail.platforms.is_empty() {
            let joined = detail.platforms.join(", ");
            if joined.chars().count() > 50 {
                format!("{}...", joined.chars().take(47).collect::<String>())
            } else {
                joined
            }
        } else if detail.is_index {
            "Multi-arch".to_string()
        } else {
            "-".to_string()
        };
        let size = if detail.is_index {
            "Index".to_string()
        } else {
            self.logger.format_size(detail.size)
        };
        let created = detail.created.map_or_else(
            || "-".to_string(),
            |created| created.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
        );
        format!("{:<30} {:<50} {:>10}  {}", name, architectures, size, created)
    }

    async fn migrate(&self, path: &Path) -> Result<RunSummary> {
        let plan = MigrationPlan::load(path)?;
        let tasks = plan.tasks()?;
        let proxy = plan.proxy_settings(self.args.proxy.as_deref(), self.args.no_proxy.as_deref())?;
        let destination_config = plan.destination()?.clone();

        self.logger.section("Image migration");
        let mut overview = vec![
            ("Destination", destination_config.registry.clone()),
            ("Tasks", tasks.len().to_string()),
        ];
        if let Some(proxy_url) = proxy.proxy_url() {
            overview.push(("Proxy", proxy_url.to_string()));
        }
        self.logger.summary_kv("Plan", &overview);

        let pool = Arc::new(ClientPool::new(plan.endpoints(), proxy.clone(), self.logger.clone()));
        let destination = pool.registry(&destination_config.registry)?;

        let provisioner = if destination_config.is_harbor() {
            let harbor = HarborClient::new(&destination_config.endpoint(), &proxy, self.logger.clone())?;
            self.logger.info("Harbor project provisioning enabled");
            Some(NamespaceProvisioner::new(
                Arc::new(harbor),
                Arc::new(NamespaceCheckedSet::new()),
                self.logger.clone(),
            ))
        } else {
            None
        };

        let migration = Migration::new(pool, destination, provisioner, self.logger.clone());
        let summary = migration.run(&tasks, &self.cancel).await;

        self.logger.summary_kv(
            "Migration finished",
            &[
                ("Succeeded", summary.succeeded.to_string()),
                ("Failed", summary.failed.to_string()),
                ("Elapsed", self.logger.elapsed_time()),
            ],
        );
        if summary.cancelled {
            self.logger.warning("Migration was interrupted");
        }
        Ok(summary)
    }
}

/// Sequential executor of migration tasks
pub struct Migration {
    sources: Arc<dyn RegistryProvider>,
    destination: Arc<dyn RegistryApi>,
    provisioner: Option<NamespaceProvisioner>,
    logger: Logger,
}

impl Migration {
    pub fn new(
        sources: Arc<dyn RegistryProvider>,
        destination: Arc<dyn RegistryApi>,
        provisioner: Option<NamespaceProvisioner>,
        logger: Logger,
    ) -> Self {
        Self {
            sources,
            destination,
            provisioner,
            logger,
        }
    }

    /// Run every task in order. Tag failures are counted, never fatal.
    pub async fn run(&self, tasks: &[MigrationTask], cancel: &CancellationToken) -> RunSummary {
        let mut summary = RunSummary::default();
        for task in tasks {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.run_task(task, cancel, &mut summary).await;
            if summary.cancelled {
                break;
            }
        }
        summary
    }

    async fn run_task(&self, task: &MigrationTask, cancel: &CancellationToken, summary: &mut RunSummary) {
        self.logger.subsection(&format!(
            "{}/{} -> {}",
            task.registry, task.repository, task.target_repository
        ));

        let source = match self.sources.registry(&task.registry) {
            Ok(source) => source,
            Err(err) => {
                self.logger
                    .error(&format!("Cannot connect to {}: {}", task.registry, err));
                summary.failed += task.tags.len().max(1);
                return;
            }
        };

        if let Some(provisioner) = &self.provisioner {
            if let Err(err) = provisioner
                .ensure_for_repository(&task.target_repository, cancel)
                .await
            {
                if err.is_cancelled() {
                    summary.cancelled = true;
                    return;
                }
                // the push may still succeed if the namespace exists
                self.logger.warning(&format!(
                    "Could not ensure namespace for {}: {}",
                    task.target_repository, err
                ));
            }
        }

        let tags = if task.tags.is_empty() {
            self.logger
                .step(&format!("No tags listed, discovering tags of {}", task.repository));
            match source.list_tags(&task.repository, cancel).await {
                Ok(tags) => tags,
                Err(err) => {
                    if err.is_cancelled() {
                        summary.cancelled = true;
                    } else {
                        self.logger
                            .error(&format!("Listing tags of {} failed: {}", task.repository, err));
                        summary.failed += 1;
                    }
                    return;
                }
            }
        } else {
            task.tags.clone()
        };

        if !task.architectures.is_empty() {
            self.logger
                .info(&format!("Architectures: {}", task.architectures.join(", ")));
        }

        let engine = CopyEngine::new(source, Arc::clone(&self.destination), self.logger.clone());
        for tag in &tags {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                return;
            }
            match self.copy_tag(&engine, task, tag, cancel).await {
                Ok(()) => summary.succeeded += 1,
                Err(err) if err.is_cancelled() => {
                    self.logger.error(&format!("{}:{} cancelled", task.repository, tag));
                    summary.failed += 1;
                    summary.cancelled = true;
                    return;
                }
                Err(err) => {
                    self.logger
                        .error(&format!("{}:{} failed: {}", task.repository, tag, err));
                    summary.failed += 1;
                }
            }
        }
    }

    async fn copy_tag(
        &self,
        engine: &CopyEngine,
        task: &MigrationTask,
        tag: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let label = format!("{}:{}", task.target_repository, tag);
        self.logger.progress(&format!(
            "Copying {}:{} -> {}",
            task.repository, tag, label
        ));

        let request = CopyRequest {
            source_repository: task.repository.clone(),
            target_repository: task.target_repository.clone(),
            reference: tag.to_string(),
            platforms: task.architectures.clone(),
        };
        let (sink, receiver) = progress_channel();
        let listener = tokio::spawn(ProgressTracker::new(label.clone(), self.logger.clone()).run(receiver));

        let result = engine.copy(&request, &sink, cancel).await;
        sink.close();
        if let Err(err) = listener.await {
            self.logger
                .detail(&format!("Progress listener for {} ended abnormally: {}", label, err));
        }

        let report = result?;
        let kind = match report.pushed_kind {
            ManifestKind::Index => "index",
            ManifestKind::Image => "image",
        };
        let platforms = if report.platforms.is_empty() {
            String::new()
        } else {
            format!(" [{}]", report.platforms.join(", "))
        };
        self.logger.success(&format!(
            "{} pushed as {} {}{} ({})",
            label,
            kind,
            report.digest,
            platforms,
            self.logger.format_size(report.bytes)
        ));
        Ok(())
    }
}

