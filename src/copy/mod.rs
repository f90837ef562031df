//! Image copy engine
//!
//! Copies one tag from a source repository to a destination repository,
//! optionally narrowed to a set of architectures:
//!
//! - an index without a filter is pushed byte-for-byte, children first
//! - a filter matching one child pushes that child as a plain image
//! - a filter matching several children pushes a [`FilteredIndex`] holding only them
//! - a plain image with a filter is checked against its config architecture
//!
//! Everything that has to be read from the source is read before the first
//! byte is pushed, so a failed fetch never leaves a partial index behind.

pub mod progress;

use crate::error::{CopyStage, RegistryError, Result};
use crate::image::digest::DigestUtils;
use crate::image::index::{resolve_child, FilteredIndex, Index, RemoteIndex};
use crate::image::manifest::{detect_kind, effective_media_type, Descriptor, ImageManifest};
use crate::image::media_types::{self, ManifestKind};
use crate::image::platform::select_descriptors;
use crate::logging::Logger;
use crate::registry::transport::{cancellable, RegistryApi, RemoteDescriptor};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use progress::{progress_channel, ProgressSink, ProgressTracker, ProgressUpdate};

/// One copy to perform
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub source_repository: String,
    pub target_repository: String,
    /// Tag, or a digest for content-addressed copies
    pub reference: String,
    /// Architecture tokens; empty copies everything
    pub platforms: Vec<String>,
}

/// What a copy pushed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyReport {
    pub pushed_kind: ManifestKind,
    pub digest: String,
    /// Platform strings of the pushed images
    pub platforms: Vec<String>,
    /// Bytes counted by the progress sink, skipped blobs included
    pub bytes: u64,
}

/// Everything needed to push a manifest, collected before pushing starts
#[derive(Debug)]
enum PushPlan {
    Image {
        manifest: ImageManifest,
        media_type: String,
        raw: Vec<u8>,
        platform: Option<String>,
    },
    Index {
        media_type: String,
        raw: Vec<u8>,
        children: Vec<PushPlan>,
    },
}

impl PushPlan {
    fn kind(&self) -> ManifestKind {
        match self {
            PushPlan::Image { .. } => ManifestKind::Image,
            PushPlan::Index { .. } => ManifestKind::Index,
        }
    }

    fn raw(&self) -> &[u8] {
        match self {
            PushPlan::Image { raw, .. } | PushPlan::Index { raw, .. } => raw,
        }
    }

    fn digest(&self) -> String {
        DigestUtils::compute_docker_digest(self.raw())
    }

    /// Distinct transferable blobs, in push order
    fn blobs(&self, seen: &mut HashSet<String>, out: &mut Vec<Descriptor>) {
        match self {
            PushPlan::Image { manifest, .. } => {
                for blob in manifest.blobs() {
                    if !media_types::is_non_distributable(&blob.media_type)
                        && seen.insert(blob.digest.clone())
                    {
                        out.push(blob.clone());
                    }
                }
            }
            PushPlan::Index { children, .. } => {
                for child in children {
                    child.blobs(seen, out);
                }
            }
        }
    }

    fn platforms(&self, out: &mut Vec<String>) {
        match self {
            PushPlan::Image { platform, .. } => {
                if let Some(platform) = platform {
                    if !out.contains(platform) {
                        out.push(platform.clone());
                    }
                }
            }
            PushPlan::Index { children, .. } => {
                for child in children {
                    child.platforms(out);
                }
            }
        }
    }
}

/// Copies images between two registries
pub struct CopyEngine {
    source: Arc<dyn RegistryApi>,
    destination: Arc<dyn RegistryApi>,
    logger: Logger,
}

impl CopyEngine {
    pub fn new(source: Arc<dyn RegistryApi>, destination: Arc<dyn RegistryApi>, logger: Logger) -> Self {
        Self {
            source,
            destination,
            logger,
        }
    }

    /// Copy one tag, reporting progress to `progress`.
    ///
    /// Failures carry the stage they happened in; cancellation is returned as
    /// [`RegistryError::Cancelled`].
    pub async fn copy(
        &self,
        request: &CopyRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<CopyReport> {
        let source = &request.source_repository;
        let descriptor = self
            .source
            .get_descriptor(source, &request.reference, cancel)
            .await
            .map_err(|e| e.during(CopyStage::FetchManifest))?;
        let kind = descriptor
            .kind()
            .map_err(|e| e.during(CopyStage::FetchManifest))?;

        let plan = match kind {
            ManifestKind::Index => self.plan_from_index(request, descriptor, cancel).await?,
            ManifestKind::Image => self.plan_from_image(request, descriptor, cancel).await?,
        };

        let mut blobs = Vec::new();
        plan.blobs(&mut HashSet::new(), &mut blobs);
        progress.set_total(blobs.iter().map(|blob| blob.size).sum());

        let stage = match plan.kind() {
            ManifestKind::Image => CopyStage::PushImage,
            ManifestKind::Index => CopyStage::PushIndex,
        };
        let uploaded = Mutex::new(HashSet::new());
        let digest = self
            .push(request, &plan, Some(request.reference.as_str()), &uploaded, progress, cancel)
            .await
            .map_err(|e| e.during(stage))?;

        let mut platforms = Vec::new();
        plan.platforms(&mut platforms);
        Ok(CopyReport {
            pushed_kind: plan.kind(),
            digest,
            platforms,
            bytes: progress.snapshot().complete,
        })
    }

    async fn plan_from_index(
        &self,
        request: &CopyRequest,
        descriptor: RemoteDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PushPlan> {
        let index = RemoteIndex::new(&descriptor.media_type, descriptor.data)
            .map_err(|e| e.during(CopyStage::FetchIndex))?;

        if request.platforms.is_empty() {
            return self
                .plan_index(&request.source_repository, &index, cancel)
                .await
                .map_err(|e| e.during(CopyStage::FetchIndex));
        }

        let selected = select_descriptors(index.manifests(), &request.platforms);
        self.logger.detail(&format!(
            "{}:{} index has {} manifests, {} match {:?}",
            request.source_repository,
            request.reference,
            index.manifests().len(),
            selected.len(),
            request.platforms
        ));

        match selected.len() {
            0 => Err(RegistryError::NoMatchingPlatform {
                requested: request.platforms.clone(),
            }),
            1 => self
                .plan_child(&request.source_repository, &selected[0], cancel)
                .await
                .map_err(|e| e.during(CopyStage::FetchManifest)),
            _ => {
                let filtered = FilteredIndex::new(&index, selected)
                    .map_err(|e| e.during(CopyStage::FetchIndex))?;
                self.logger.detail(&format!(
                    "Reducing index {} to {} manifests",
                    filtered.source_digest(),
                    filtered.manifests().len()
                ));
                self.plan_index(&request.source_repository, &filtered, cancel)
                    .await
                    .map_err(|e| e.during(CopyStage::FetchIndex))
            }
        }
    }

    async fn plan_from_image(
        &self,
        request: &CopyRequest,
        descriptor: RemoteDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PushPlan> {
        let mut plan = image_plan(&descriptor.media_type, descriptor.data, None)
            .map_err(|e| e.during(CopyStage::FetchManifest))?;
        let PushPlan::Image { manifest, platform, .. } = &mut plan else {
            return Ok(plan);
        };

        match self
            .source
            .read_config(&request.source_repository, &manifest.config.digest, cancel)
            .await
        {
            Ok(config) => {
                let image_platform = config.platform();
                if !request.platforms.is_empty() && !image_platform.matches_any(&request.platforms) {
                    return Err(RegistryError::PlatformMismatch {
                        architecture: config.architecture,
                        requested: request.platforms.clone(),
                    });
                }
                *platform = Some(image_platform.to_string());
            }
            Err(RegistryError::Cancelled) => return Err(RegistryError::Cancelled),
            Err(err) => {
                // unreadable config: the architecture cannot be checked, copy anyway
                self.logger.warning(&format!(
                    "Could not read config of {}:{}, skipping architecture check: {}",
                    request.source_repository, request.reference, err
                ));
            }
        }
        Ok(plan)
    }

    /// Fetch every child of an index, recursively
    fn plan_index<'a>(
        &'a self,
        repository: &'a str,
        index: &'a dyn Index,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<PushPlan>> {
        async move {
            let mut children = Vec::with_capacity(index.manifests().len());
            for child in index.manifests() {
                children.push(self.plan_child(repository, child, cancel).await?);
            }
            Ok(PushPlan::Index {
                media_type: index.media_type().to_string(),
                raw: index.raw_manifest()?.to_vec(),
                children,
            })
        }
        .boxed()
    }

    fn plan_child<'a>(
        &'a self,
        repository: &'a str,
        child: &'a Descriptor,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<PushPlan>> {
        async move {
            let fetched = resolve_child(self.source.as_ref(), repository, child, cancel).await?;
            let media_type = fetched.media_type.clone();
            let kind = detect_kind(Some(media_type.as_str()).filter(|m| !m.is_empty()), &fetched.data)?;

            match kind {
                ManifestKind::Image => {
                    let platform = child
                        .platform
                        .as_ref()
                        .filter(|p| p.is_known())
                        .map(|p| p.to_string());
                    image_plan(&media_type, fetched.data, platform)
                }
                ManifestKind::Index => {
                    let nested = RemoteIndex::new(&media_type, fetched.data)?;
                    self.plan_index(repository, &nested, cancel).await
                }
            }
        }
        .boxed()
    }

    /// Push a plan: blobs, children by digest, then the manifest itself.
    ///
    /// `reference` is the tag to push under; `None` or a digest pushes by the
    /// object's own digest.
    fn push<'a>(
        &'a self,
        request: &'a CopyRequest,
        plan: &'a PushPlan,
        reference: Option<&'a str>,
        uploaded: &'a Mutex<HashSet<String>>,
        progress: &'a ProgressSink,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String>> {
        async move {
            let target = &request.target_repository;
            let media_type = match plan {
                PushPlan::Image { manifest, media_type, .. } => {
                    for blob in manifest.blobs() {
                        self.transfer_blob(request, blob, uploaded, progress, cancel)
                            .await?;
                    }
                    media_type
                }
                PushPlan::Index { children, media_type, .. } => {
                    for child in children {
                        self.push(request, child, None, uploaded, progress, cancel)
                            .await?;
                    }
                    media_type
                }
            };

            let digest = plan.digest();
            let reference = match reference {
                Some(tag) if !DigestUtils::is_digest_reference(tag) => tag.to_string(),
                _ => digest.clone(),
            };
            self.logger
                .detail(&format!("Pushing manifest {}:{} ({})", target, reference, digest));
            self.destination
                .put_manifest(target, &reference, media_type, plan.raw().to_vec(), cancel)
                .await?;
            Ok(digest)
        }
        .boxed()
    }

    async fn transfer_blob(
        &self,
        request: &CopyRequest,
        blob: &Descriptor,
        uploaded: &Mutex<HashSet<String>>,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if media_types::is_non_distributable(&blob.media_type) {
            self.logger
                .detail(&format!("Skipping non-distributable blob {}", blob.digest));
            return Ok(());
        }
        let first_time = lock(uploaded).insert(blob.digest.clone());
        if !first_time {
            return Ok(());
        }

        let target = &request.target_repository;
        if self
            .destination
            .blob_exists(target, &blob.digest, cancel)
            .await?
        {
            self.logger
                .detail(&format!("Blob {} already present in {}", blob.digest, target));
            progress.advance(blob.size);
            return Ok(());
        }

        let stream = self
            .source
            .get_blob(&request.source_repository, &blob.digest, cancel)
            .await?;
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<u64>();
        let stream = stream
            .inspect(move |chunk| {
                if let Ok(bytes) = chunk {
                    let _ = chunk_tx.send(bytes.len() as u64);
                }
            })
            .boxed();

        let upload = cancellable(
            cancel,
            self.destination
                .put_blob(target, &blob.digest, blob.size, stream, cancel),
        );
        // ends when the upload drops the stream
        let relay = async {
            let mut streamed = 0u64;
            while let Some(bytes) = chunk_rx.recv().await {
                streamed += bytes;
                progress.advance(bytes);
            }
            streamed
        };
        let (result, streamed) = tokio::join!(upload, relay);
        result?;

        if streamed < blob.size {
            progress.advance(blob.size - streamed);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn image_plan(media_type: &str, raw: Vec<u8>, platform: Option<String>) -> Result<PushPlan> {
    let manifest = ImageManifest::from_slice(&raw)?;
    let media_type = if media_types::base_media_type(media_type).is_empty()
        || ManifestKind::from_media_type(media_type).is_none()
    {
        effective_media_type(manifest.media_type.as_deref(), ManifestKind::Image)
    } else {
        media_types::base_media_type(media_type).to_string()
    };
    Ok(PushPlan::Image {
        manifest,
        media_type,
        raw,
        platform,
    })
}
