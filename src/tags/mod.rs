//! Tag enumeration with per-tag details
//!
//! Details are fetched with bounded parallelism and reassembled in the order
//! the registry listed the tags. A tag whose details cannot be fetched still
//! appears, with only its name filled in.

use crate::error::Result;
use crate::image::manifest::{ImageIndex, ImageManifest};
use crate::image::media_types::ManifestKind;
use crate::logging::Logger;
use crate::registry::transport::RegistryApi;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CONCURRENCY: usize = 10;

/// Summary of one tag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDetail {
    pub name: String,
    pub digest: String,
    /// Total layer size for images, 0 for indexes
    pub size: u64,
    /// `os/arch[/variant]` strings, unknown platforms excluded
    pub platforms: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub is_index: bool,
}

impl TagDetail {
    pub fn name_only(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

pub struct TagEnumerator {
    client: Arc<dyn RegistryApi>,
    concurrency: usize,
    logger: Logger,
}

impl TagEnumerator {
    pub fn new(client: Arc<dyn RegistryApi>, logger: Logger) -> Self {
        Self {
            client,
            concurrency: DEFAULT_CONCURRENCY,
            logger,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// List every tag of `repository` with details, preserving listing order
    pub async fn enumerate(
        &self,
        repository: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TagDetail>> {
        let tags = self.client.list_tags(repository, cancel).await?;
        self.details(repository, &tags, cancel).await
    }

    /// Details for the given tags, in the given order
    pub async fn details(
        &self,
        repository: &str,
        tags: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<TagDetail>> {
        self.logger.detail(&format!(
            "Fetching details for {} tags of {} ({} at a time)",
            tags.len(),
            repository,
            self.concurrency
        ));

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();
        for (position, tag) in tags.iter().enumerate() {
            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);
            let repository = repository.to_string();
            let tag = tag.clone();
            let cancel = cancel.clone();
            let logger = self.logger.clone();
            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (position, TagDetail::name_only(&tag));
                };
                let detail = match fetch_detail(client.as_ref(), &repository, &tag, &cancel).await {
                    Ok(detail) => detail,
                    Err(err) => {
                        logger.detail(&format!("Details for {}:{} unavailable: {}", repository, tag, err));
                        TagDetail::name_only(&tag)
                    }
                };
                (position, detail)
            });
        }

        let mut details: Vec<Option<TagDetail>> = vec![None; tags.len()];
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((position, detail)) => details[position] = Some(detail),
                Err(err) => self
                    .logger
                    .warning(&format!("Tag detail worker failed: {}", err)),
            }
        }

        if cancel.is_cancelled() {
            return Err(crate::error::RegistryError::Cancelled);
        }

        Ok(details
            .into_iter()
            .zip(tags.iter())
            .map(|(detail, tag)| detail.unwrap_or_else(|| TagDetail::name_only(tag)))
            .collect())
    }
}

/// Details of one tag, fetched sequentially
pub async fn fetch_detail(
    client: &dyn RegistryApi,
    repository: &str,
    tag: &str,
    cancel: &CancellationToken,
) -> Result<TagDetail> {
    let descriptor = client.get_descriptor(repository, tag, cancel).await?;
    let mut detail = TagDetail {
        name: tag.to_string(),
        digest: descriptor.digest.clone(),
        size: descriptor.size,
        ..Default::default()
    };

    match descriptor.kind()? {
        ManifestKind::Index => {
            detail.is_index = true;
            detail.size = 0;
            let Ok(index) = ImageIndex::from_slice(&descriptor.data) else {
                return Ok(detail);
            };
            for child in &index.manifests {
                let Some(platform) = child.platform.as_ref().filter(|p| p.is_known()) else {
                    continue;
                };
                let name = platform.to_string();
                if !detail.platforms.contains(&name) {
                    detail.platforms.push(name);
                }
                if platform.os != "linux" {
                    continue;
                }
                if let Some(created) = child_created(client, repository, &child.digest, cancel).await {
                    detail.created = Some(detail.created.map_or(created, |c| c.min(created)));
                }
            }
        }
        ManifestKind::Image => {
            let Ok(manifest) = ImageManifest::from_slice(&descriptor.data) else {
                return Ok(detail);
            };
            detail.size = manifest.layer_size();
            if let Ok(config) = client
                .read_config(repository, &manifest.config.digest, cancel)
                .await
            {
                let platform = config.platform();
                if platform.is_known() {
                    detail.platforms.push(platform.to_string());
                }
                detail.created = config.created_at();
            }
        }
    }
    Ok(detail)
}

async fn child_created(
    client: &dyn RegistryApi,
    repository: &str,
    digest: &str,
    cancel: &CancellationToken,
) -> Option<DateTime<Utc>> {
    let child = client.get_descriptor(repository, digest, cancel).await.ok()?;
    let manifest = ImageManifest::from_slice(&child.data).ok()?;
    let config = client
        .read_config(repository, &manifest.config.digest, cancel)
        .await
        .ok()?;
    config.created_at()
}
