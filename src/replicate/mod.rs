//! Replication orchestration: the `Replicator` interface and the
//! cluster-targeting implementation driving the blob transfer protocol.

pub mod context;
pub mod scheduled;

pub use context::ReplicaContext;
pub use scheduled::{RunSummary, ScheduledReplicator};

use crate::config::{ConflictStrategy, RetryPolicy};
use crate::error::{ReplicaError, Result};
use crate::manifest::ManifestInspector;
use crate::model::{NodeInfo, PackageVersion, ProjectInfo, RepoInfo};
use crate::remote::blob::{BlobPayload, BlobTransfer};
use crate::remote::metadata::MetadataClient;
use crate::store::{ArtifactStore, ByteThrottle, RateThrottle};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// The task's configured rate limit applied on top of the system-wide
/// throttle.
struct TaskThrottle {
    system: Arc<dyn ByteThrottle>,
    rate: RateThrottle,
}

#[async_trait]
impl ByteThrottle for TaskThrottle {
    async fn acquire(&self, bytes: usize) {
        self.system.acquire(bytes).await;
        self.rate.acquire(bytes).await;
    }
}

/// Result of replicating one artifact unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Replicated { bytes: u64 },
    /// Conflict strategy `SKIP` left the remote copy untouched.
    Skipped,
}

impl UnitOutcome {
    pub fn bytes_sent(&self) -> u64 {
        match self {
            UnitOutcome::Replicated { bytes } => *bytes,
            UnitOutcome::Skipped => 0,
        }
    }
}

/// The replication actions one run is composed of. Strategy structs are
/// selected by target cluster and package type at construction time.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Idempotent: create the remote project only when absent.
    async fn replica_project(&self, ctx: &ReplicaContext) -> Result<()>;

    /// Idempotent: create the remote repository only when absent.
    async fn replica_repo(&self, ctx: &ReplicaContext) -> Result<()>;

    /// Replicate one package version: conflict gate, every blob, then the
    /// version record.
    async fn replica_package_version(
        &self,
        ctx: &ReplicaContext,
        version: &PackageVersion,
    ) -> Result<UnitOutcome>;

    /// Replicate one file node: conflict gate, blob, then node metadata.
    async fn replica_file(&self, ctx: &ReplicaContext, node: &NodeInfo) -> Result<UnitOutcome>;

    /// Replicate one folder node (metadata only).
    async fn replica_dir(&self, ctx: &ReplicaContext, node: &NodeInfo) -> Result<UnitOutcome>;
}

/// Decision from the per-unit conflict gate, evaluated exactly once
/// before any bytes are sent.
enum Gate {
    Proceed,
    Skip,
}

fn conflict_gate(strategy: ConflictStrategy, exists: bool, what: &str) -> Result<Gate> {
    if !exists {
        return Ok(Gate::Proceed);
    }
    match strategy {
        ConflictStrategy::Skip => Ok(Gate::Skip),
        ConflictStrategy::FastFail => Err(ReplicaError::Conflict(format!(
            "{what} already exists on the remote cluster"
        ))),
        ConflictStrategy::Overwrite => Ok(Gate::Proceed),
    }
}

/// Replicates artifacts from the local store into one remote cluster.
/// The worker pool is process-wide: total blob concurrency stays bounded
/// no matter how many versions replicate at once.
pub struct ClusterReplicator {
    store: Arc<dyn ArtifactStore>,
    throttle: Arc<dyn ByteThrottle>,
    pool: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl ClusterReplicator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        throttle: Arc<dyn ByteThrottle>,
        pool: Arc<Semaphore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            throttle,
            pool,
            retry,
        }
    }

    fn blob_transfer(&self, ctx: &ReplicaContext, authorization: String) -> BlobTransfer {
        let throttle: Arc<dyn ByteThrottle> = match ctx.task.transfer.rate_limit_bps {
            Some(bps) => Arc::new(TaskThrottle {
                system: Arc::clone(&self.throttle),
                rate: RateThrottle::new(bps),
            }),
            None => Arc::clone(&self.throttle),
        };
        BlobTransfer::new(
            ctx.executor_with(authorization),
            ctx.cluster.base_url(),
            ctx.repo_path(),
            ctx.task.transfer.chunk_size,
            ctx.task.transfer.parallelism,
            throttle,
            self.retry.clone(),
        )
    }

    async fn load_payload(&self, digest: &str, size: u64) -> Result<BlobPayload> {
        let data = self.store.read_blob(digest).await?;
        Ok(BlobPayload {
            info: crate::model::FileInfo {
                sha256: digest.to_string(),
                md5: None,
                size,
            },
            data,
        })
    }

    /// Push every blob of a manifest-bearing version, then the manifest.
    async fn push_manifest_version(
        &self,
        ctx: &ReplicaContext,
        version: &PackageVersion,
        authorization: String,
    ) -> Result<u64> {
        let inspector = ManifestInspector::new(Arc::clone(&self.store));
        let found = inspector
            .inspect(&ctx.task.source.project, &ctx.task.source.repo, version)
            .await?;

        let mut blobs = Vec::with_capacity(found.descriptors.len());
        for descriptor in &found.descriptors {
            blobs.push(self.load_payload(&descriptor.digest, descriptor.size).await?);
        }

        let transfer = self.blob_transfer(ctx, authorization.clone());
        let bytes = transfer.push_all(&blobs, &self.pool).await?;

        // The manifest goes last: its presence marks the version pullable.
        let manifests = MetadataClient::new(
            ctx.executor_with(authorization),
            ctx.cluster.base_url(),
        );
        manifests
            .put_manifest(
                &ctx.repo_path(),
                &version.name,
                &found.media_type,
                found.raw.clone(),
            )
            .await?;

        Ok(bytes)
    }

    /// Push the file nodes composing a non-manifest version, then their
    /// node records.
    async fn push_plain_version(
        &self,
        ctx: &ReplicaContext,
        version: &PackageVersion,
        authorization: String,
    ) -> Result<u64> {
        let nodes = self
            .store
            .version_nodes(&ctx.task.source.project, &ctx.task.source.repo, version)
            .await?;

        let mut blobs = Vec::new();
        let mut file_nodes = Vec::new();
        for node in nodes {
            if let Some(info) = node.file_info() {
                blobs.push(BlobPayload {
                    data: self.store.read_blob(&info.sha256).await?,
                    info,
                });
                file_nodes.push(node);
            }
        }

        let transfer = self.blob_transfer(ctx, authorization);
        let bytes = transfer.push_all(&blobs, &self.pool).await?;

        let metadata = ctx.metadata();
        for node in &file_nodes {
            metadata
                .create_node(
                    &ctx.remote_project,
                    &ctx.remote_repo,
                    node,
                    ctx.task.include_metadata,
                )
                .await?;
        }

        Ok(bytes)
    }
}

#[async_trait]
impl Replicator for ClusterReplicator {
    async fn replica_project(&self, ctx: &ReplicaContext) -> Result<()> {
        let local = self
            .store
            .project(&ctx.task.source.project)
            .await?
            .ok_or_else(|| {
                ReplicaError::NotFound(format!("local project {}", ctx.task.source.project))
            })?;

        let metadata = ctx.metadata();
        if metadata.project_exists(&ctx.remote_project).await? {
            return Ok(());
        }

        tracing::info!(
            project = %ctx.remote_project,
            cluster = %ctx.cluster.name,
            "creating remote project"
        );
        metadata
            .create_project(&ProjectInfo {
                name: ctx.remote_project.clone(),
                display_name: local.display_name,
                description: local.description,
            })
            .await
    }

    async fn replica_repo(&self, ctx: &ReplicaContext) -> Result<()> {
        let local = self
            .store
            .repo(&ctx.task.source.project, &ctx.task.source.repo)
            .await?
            .ok_or_else(|| {
                ReplicaError::NotFound(format!(
                    "local repo {}/{}",
                    ctx.task.source.project, ctx.task.source.repo
                ))
            })?;

        let metadata = ctx.metadata();
        if metadata
            .repo_exists(&ctx.remote_project, &ctx.remote_repo)
            .await?
        {
            return Ok(());
        }

        tracing::info!(
            repo = %ctx.repo_path(),
            cluster = %ctx.cluster.name,
            "creating remote repository"
        );
        metadata
            .create_repo(
                &ctx.remote_project,
                &RepoInfo {
                    project: ctx.remote_project.clone(),
                    name: ctx.remote_repo.clone(),
                    repo_type: local.repo_type,
                    description: local.description,
                },
            )
            .await
    }

    async fn replica_package_version(
        &self,
        ctx: &ReplicaContext,
        version: &PackageVersion,
    ) -> Result<UnitOutcome> {
        let what = format!("{}:{}", version.key, version.name);
        let metadata = ctx.metadata();
        let exists = metadata
            .package_version_exists(
                &ctx.remote_project,
                &ctx.remote_repo,
                &version.key,
                &version.name,
            )
            .await?;
        if let Gate::Skip = conflict_gate(ctx.task.conflict_strategy, exists, &what)? {
            tracing::info!(version = %what, "remote version present, skipping");
            return Ok(UnitOutcome::Skipped);
        }

        let repo = self
            .store
            .repo(&ctx.task.source.project, &ctx.task.source.repo)
            .await?
            .ok_or_else(|| {
                ReplicaError::NotFound(format!(
                    "local repo {}/{}",
                    ctx.task.source.project, ctx.task.source.repo
                ))
            })?;

        // One authorization per version, reused for all of its blobs.
        let authorization = ctx.resolve_blob_authorization().await?;

        let bytes = if repo.repo_type.manifest_bearing() {
            self.push_manifest_version(ctx, version, authorization)
                .await?
        } else {
            self.push_plain_version(ctx, version, authorization).await?
        };

        // Blob-before-metadata: the record is written only after every
        // byte of the version landed.
        metadata
            .create_package_version(
                &ctx.remote_project,
                &ctx.remote_repo,
                version,
                ctx.task.include_metadata,
            )
            .await?;

        tracing::info!(version = %what, bytes, "package version replicated");
        Ok(UnitOutcome::Replicated { bytes })
    }

    async fn replica_file(&self, ctx: &ReplicaContext, node: &NodeInfo) -> Result<UnitOutcome> {
        let metadata = ctx.metadata();
        let exists = metadata
            .node_exists(&ctx.remote_project, &ctx.remote_repo, &node.path)
            .await?;
        if let Gate::Skip = conflict_gate(ctx.task.conflict_strategy, exists, &node.path)? {
            tracing::debug!(path = %node.path, "remote node present, skipping");
            return Ok(UnitOutcome::Skipped);
        }

        let bytes = if let Some(info) = node.file_info() {
            let data = self.store.read_blob(&info.sha256).await?;
            let authorization = ctx.resolve_blob_authorization().await?;
            let transfer = self.blob_transfer(ctx, authorization);
            let outcome = transfer.push(&info, &data).await?;
            outcome.bytes_sent()
        } else {
            0
        };

        metadata
            .create_node(
                &ctx.remote_project,
                &ctx.remote_repo,
                node,
                ctx.task.include_metadata,
            )
            .await?;

        Ok(UnitOutcome::Replicated { bytes })
    }

    async fn replica_dir(&self, ctx: &ReplicaContext, node: &NodeInfo) -> Result<UnitOutcome> {
        let metadata = ctx.metadata();
        let exists = metadata
            .node_exists(&ctx.remote_project, &ctx.remote_repo, &node.path)
            .await?;
        if let Gate::Skip = conflict_gate(ctx.task.conflict_strategy, exists, &node.path)? {
            return Ok(UnitOutcome::Skipped);
        }

        metadata
            .create_node(
                &ctx.remote_project,
                &ctx.remote_repo,
                node,
                ctx.task.include_metadata,
            )
            .await?;
        Ok(UnitOutcome::Replicated { bytes: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_passes_when_remote_is_absent() {
        for strategy in [
            ConflictStrategy::Skip,
            ConflictStrategy::Overwrite,
            ConflictStrategy::FastFail,
        ] {
            assert!(matches!(
                conflict_gate(strategy, false, "a").unwrap(),
                Gate::Proceed
            ));
        }
    }

    #[test]
    fn gate_applies_strategy_on_conflict() {
        assert!(matches!(
            conflict_gate(ConflictStrategy::Skip, true, "a").unwrap(),
            Gate::Skip
        ));
        assert!(matches!(
            conflict_gate(ConflictStrategy::Overwrite, true, "a").unwrap(),
            Gate::Proceed
        ));
        assert!(matches!(
            conflict_gate(ConflictStrategy::FastFail, true, "a"),
            Err(ReplicaError::Conflict(_))
        ));
    }
}
