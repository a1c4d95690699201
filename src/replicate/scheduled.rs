//! Full-run orchestration for scheduled and one-off replication.
//!
//! A run walks the task's artifact selection in a stable order, feeding
//! each unit through the replicator and the progress tracker. Unit
//! failures under `SKIP`/`OVERWRITE` are logged and the run continues;
//! under `FAST_FAIL` the first failure aborts the walk.

use crate::config::{ConflictStrategy, TaskObject};
use crate::error::{ReplicaError, Result};
use crate::model::ArtifactUnit;
use crate::progress::{ProgressTracker, RunProgress, RunStatus};
use crate::replicate::context::ReplicaContext;
use crate::replicate::{Replicator, UnitOutcome};
use crate::store::{ArtifactStore, RunRecorder};
use std::sync::Arc;
use uuid::Uuid;

/// Terminal report of one run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub progress: RunProgress,
}

/// Drives one complete replication run for a (task, target cluster) pair.
pub struct ScheduledReplicator {
    store: Arc<dyn ArtifactStore>,
    recorder: Arc<dyn RunRecorder>,
    replicator: Arc<dyn Replicator>,
}

impl ScheduledReplicator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        recorder: Arc<dyn RunRecorder>,
        replicator: Arc<dyn Replicator>,
    ) -> Self {
        Self {
            store,
            recorder,
            replicator,
        }
    }

    /// Execute the run end to end. The terminal status is persisted even
    /// when the walk aborts early.
    pub async fn run(&self, ctx: &ReplicaContext) -> Result<RunSummary> {
        let tracker =
            ProgressTracker::begin(Arc::clone(&self.recorder), &ctx.task.id, &ctx.cluster.id)
                .await?;
        tracing::info!(
            run_id = %tracker.run_id(),
            task = %ctx.task.id,
            cluster = %ctx.cluster.name,
            repo = %ctx.repo_path(),
            "replication run started"
        );

        self.check_remote_version(ctx).await;

        let status = match self.execute(ctx, &tracker).await {
            Ok(()) => RunStatus::Success,
            Err(err) => {
                tracing::error!(
                    run_id = %tracker.run_id(),
                    task = %ctx.task.id,
                    error = %err,
                    "replication run failed"
                );
                RunStatus::Failed
            }
        };

        tracker.finish(status).await?;
        let progress = tracker.snapshot().await;
        tracing::info!(
            run_id = %tracker.run_id(),
            status = ?status,
            items = progress.items_processed,
            bytes = progress.bytes_sent,
            "replication run finished"
        );
        Ok(RunSummary {
            run_id: tracker.run_id(),
            status,
            progress,
        })
    }

    /// Warn-only compatibility probe. Mixed-version clusters replicate
    /// fine in practice; an unreachable version endpoint must not block
    /// the run either.
    async fn check_remote_version(&self, ctx: &ReplicaContext) {
        match ctx.metadata().remote_version().await {
            Ok(remote) => {
                let local = env!("CARGO_PKG_VERSION");
                if remote != local {
                    tracing::warn!(
                        cluster = %ctx.cluster.name,
                        local,
                        remote = %remote,
                        "engine version differs from remote cluster"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    cluster = %ctx.cluster.name,
                    error = %err,
                    "could not probe remote engine version"
                );
            }
        }
    }

    async fn execute(&self, ctx: &ReplicaContext, tracker: &ProgressTracker) -> Result<()> {
        self.replicator.replica_project(ctx).await?;
        self.replicator.replica_repo(ctx).await?;

        let mut failed = 0u64;
        if ctx.task.replicate_all || ctx.task.objects.is_empty() {
            failed += self.replicate_tree(ctx, tracker, "").await?;
        } else {
            for object in &ctx.task.objects {
                failed += match object {
                    TaskObject::Package { key, versions } => {
                        self.replicate_package(ctx, tracker, key, versions.as_deref())
                            .await?
                    }
                    TaskObject::Path { prefix } => {
                        self.replicate_tree(ctx, tracker, prefix).await?
                    }
                };
            }
        }
        if failed > 0 {
            return Err(ReplicaError::Upload(format!(
                "{failed} unit(s) failed to replicate"
            )));
        }
        Ok(())
    }

    /// Replicate every node under `prefix`, folders before their files.
    /// Returns the count of failed units under continue-on-error
    /// strategies.
    async fn replicate_tree(
        &self,
        ctx: &ReplicaContext,
        tracker: &ProgressTracker,
        prefix: &str,
    ) -> Result<u64> {
        let mut nodes = self
            .store
            .list_nodes(&ctx.task.source.project, &ctx.task.source.repo, prefix)
            .await?;
        nodes.sort_by(|a, b| a.path.cmp(&b.path));

        let mut failed = 0;
        for node in nodes {
            let unit = ArtifactUnit::Node(node.clone());
            let result = if node.folder {
                self.replicator.replica_dir(ctx, &node).await
            } else {
                self.replicator.replica_file(ctx, &node).await
            };
            failed += self.handle_unit(ctx, tracker, &unit, result).await?;
        }
        Ok(failed)
    }

    async fn replicate_package(
        &self,
        ctx: &ReplicaContext,
        tracker: &ProgressTracker,
        key: &str,
        versions: Option<&[String]>,
    ) -> Result<u64> {
        let selected = match versions {
            Some(names) => {
                let mut selected = Vec::with_capacity(names.len());
                for name in names {
                    let version = self
                        .store
                        .package_version(&ctx.task.source.project, &ctx.task.source.repo, key, name)
                        .await?
                        .ok_or_else(|| {
                            ReplicaError::NotFound(format!("local version {key}:{name}"))
                        })?;
                    selected.push(version);
                }
                selected
            }
            None => {
                self.store
                    .package_versions(&ctx.task.source.project, &ctx.task.source.repo, key)
                    .await?
            }
        };

        let mut failed = 0;
        for version in selected {
            let unit = ArtifactUnit::Package(version.clone());
            let result = self.replicator.replica_package_version(ctx, &version).await;
            failed += self.handle_unit(ctx, tracker, &unit, result).await?;
        }
        Ok(failed)
    }

    /// Account for one unit result. Under `FAST_FAIL` any failure aborts
    /// the walk; otherwise failures are logged and the walk moves on.
    async fn handle_unit(
        &self,
        ctx: &ReplicaContext,
        tracker: &ProgressTracker,
        unit: &ArtifactUnit,
        result: Result<UnitOutcome>,
    ) -> Result<u64> {
        match result {
            Ok(outcome) => {
                tracker.item_done(outcome.bytes_sent()).await;
                Ok(0)
            }
            Err(err) if ctx.task.conflict_strategy == ConflictStrategy::FastFail => Err(err),
            Err(err) => {
                tracing::error!(
                    run_id = %ctx.run_id,
                    unit = %unit.describe(),
                    error = %err,
                    "unit replication failed, continuing run"
                );
                Ok(1)
            }
        }
    }
}
