//! Event-driven replication: the in-process event bus and the router that
//! turns domain events into remote replication actions.
//!
//! Routing is fire-and-forget: each matching (task, target) pair gets its
//! own spawned dispatch with bounded retries. An event whose remote apply
//! depends on an earlier event having landed (rename, move, delete and
//! friends) first waits for the referenced path to appear remotely.

use crate::cluster::ClusterDirectory;
use crate::config::{ReplicationMode, ReplicationTask, RetryPolicy, WaitPolicy};
use crate::error::{ReplicaError, Result};
use crate::replicate::{ReplicaContext, Replicator};
use crate::store::{ArtifactStore, TaskSource};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Mutations of the local artifact tree that event-driven tasks mirror.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    ProjectCreated {
        project: String,
    },
    RepoCreated {
        project: String,
        repo: String,
    },
    RepoUpdated {
        project: String,
        repo: String,
    },
    RepoDeleted {
        project: String,
        repo: String,
    },
    NodeCreated {
        project: String,
        repo: String,
        path: String,
    },
    NodeUpdated {
        project: String,
        repo: String,
        path: String,
    },
    NodeRenamed {
        project: String,
        repo: String,
        path: String,
        new_path: String,
    },
    NodeMoved {
        project: String,
        repo: String,
        path: String,
        target_path: String,
    },
    NodeCopied {
        project: String,
        repo: String,
        path: String,
        target_path: String,
    },
    NodeDeleted {
        project: String,
        repo: String,
        path: String,
    },
    MetadataSaved {
        project: String,
        repo: String,
        path: String,
        metadata: HashMap<String, String>,
    },
    MetadataDeleted {
        project: String,
        repo: String,
        path: String,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::ProjectCreated { .. } => "project_created",
            DomainEvent::RepoCreated { .. } => "repo_created",
            DomainEvent::RepoUpdated { .. } => "repo_updated",
            DomainEvent::RepoDeleted { .. } => "repo_deleted",
            DomainEvent::NodeCreated { .. } => "node_created",
            DomainEvent::NodeUpdated { .. } => "node_updated",
            DomainEvent::NodeRenamed { .. } => "node_renamed",
            DomainEvent::NodeMoved { .. } => "node_moved",
            DomainEvent::NodeCopied { .. } => "node_copied",
            DomainEvent::NodeDeleted { .. } => "node_deleted",
            DomainEvent::MetadataSaved { .. } => "metadata_saved",
            DomainEvent::MetadataDeleted { .. } => "metadata_deleted",
        }
    }

    pub fn project(&self) -> &str {
        match self {
            DomainEvent::ProjectCreated { project }
            | DomainEvent::RepoCreated { project, .. }
            | DomainEvent::RepoUpdated { project, .. }
            | DomainEvent::RepoDeleted { project, .. }
            | DomainEvent::NodeCreated { project, .. }
            | DomainEvent::NodeUpdated { project, .. }
            | DomainEvent::NodeRenamed { project, .. }
            | DomainEvent::NodeMoved { project, .. }
            | DomainEvent::NodeCopied { project, .. }
            | DomainEvent::NodeDeleted { project, .. }
            | DomainEvent::MetadataSaved { project, .. }
            | DomainEvent::MetadataDeleted { project, .. } => project,
        }
    }

    pub fn repo(&self) -> Option<&str> {
        match self {
            DomainEvent::ProjectCreated { .. } => None,
            DomainEvent::RepoCreated { repo, .. }
            | DomainEvent::RepoUpdated { repo, .. }
            | DomainEvent::RepoDeleted { repo, .. }
            | DomainEvent::NodeCreated { repo, .. }
            | DomainEvent::NodeUpdated { repo, .. }
            | DomainEvent::NodeRenamed { repo, .. }
            | DomainEvent::NodeMoved { repo, .. }
            | DomainEvent::NodeCopied { repo, .. }
            | DomainEvent::NodeDeleted { repo, .. }
            | DomainEvent::MetadataSaved { repo, .. }
            | DomainEvent::MetadataDeleted { repo, .. } => Some(repo),
        }
    }

    /// Remote path this event mutates in place. Events referencing one
    /// wait for it to exist remotely before applying, since the event
    /// that created the path may still be in flight.
    pub fn precondition_path(&self) -> Option<&str> {
        match self {
            DomainEvent::NodeRenamed { path, .. }
            | DomainEvent::NodeMoved { path, .. }
            | DomainEvent::NodeCopied { path, .. }
            | DomainEvent::NodeDeleted { path, .. }
            | DomainEvent::NodeUpdated { path, .. }
            | DomainEvent::MetadataSaved { path, .. }
            | DomainEvent::MetadataDeleted { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// In-process fan-out channel for domain events. Cloning shares the
/// underlying channel; slow subscribers drop the oldest events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Delivery is best-effort; with no subscribers the
    /// event is dropped silently.
    pub fn publish(&self, event: DomainEvent) {
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            tracing::debug!(kind, "event published with no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Subscribes to the event bus and dispatches matching events to every
/// event-driven task targeting a known cluster.
pub struct EventRouter {
    tasks: Arc<dyn TaskSource>,
    clusters: Arc<ClusterDirectory>,
    store: Arc<dyn ArtifactStore>,
    replicator: Arc<dyn Replicator>,
    retry: RetryPolicy,
    wait: WaitPolicy,
    cancel: CancellationToken,
}

impl EventRouter {
    pub fn new(
        tasks: Arc<dyn TaskSource>,
        clusters: Arc<ClusterDirectory>,
        store: Arc<dyn ArtifactStore>,
        replicator: Arc<dyn Replicator>,
        retry: RetryPolicy,
        wait: WaitPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tasks,
            clusters,
            store,
            replicator,
            retry,
            wait,
            cancel,
        }
    }

    /// Consume the bus until cancellation. Lag is logged and skipped; the
    /// dropped events are lost, matching best-effort delivery.
    pub fn spawn(
        self: Arc<Self>,
        mut receiver: broadcast::Receiver<DomainEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        tracing::info!("event router shutting down");
                        return;
                    }
                    received = receiver.recv() => match received {
                        Ok(event) => self.route(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "event subscriber lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("event bus closed, router stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Fan an event out to every matching (task, target cluster) pair.
    pub async fn route(self: &Arc<Self>, event: DomainEvent) {
        let tasks = match self
            .tasks
            .active_tasks(event.project(), event.repo())
            .await
        {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::error!(
                    kind = event.kind(),
                    project = event.project(),
                    error = %err,
                    "task lookup failed, event dropped"
                );
                return;
            }
        };

        for task in tasks {
            if task.mode != ReplicationMode::EventDriven {
                continue;
            }
            for target in &task.targets {
                let Some(cluster) = self.clusters.get(target) else {
                    tracing::warn!(
                        task = %task.id,
                        cluster = %target,
                        "task targets unknown cluster, skipping"
                    );
                    continue;
                };
                let router = Arc::clone(self);
                let task = task.clone();
                let cluster = cluster.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    router.dispatch(task, cluster, event).await;
                });
            }
        }
    }

    /// Apply one event against one target cluster with bounded retries.
    /// Exhausted retries drop the event; the next scheduled run heals the
    /// divergence.
    async fn dispatch(
        &self,
        task: ReplicationTask,
        cluster: crate::cluster::ClusterNode,
        event: DomainEvent,
    ) {
        let kind = event.kind();
        let task_id = task.id.clone();
        let cluster_name = cluster.name.clone();

        let ctx = match ReplicaContext::new(task, cluster) {
            Ok(ctx) => ctx,
            Err(err) => {
                tracing::error!(
                    kind,
                    task = %task_id,
                    cluster = %cluster_name,
                    error = %err,
                    "could not build replication context, event dropped"
                );
                return;
            }
        };

        // The existence wait runs once, ahead of the retry loop: an
        // exhausted wait abandons the event instead of polling again on
        // every attempt.
        if let Some(path) = event.precondition_path() {
            if let Err(err) = self.wait_for_remote(&ctx, path).await {
                tracing::error!(
                    kind,
                    task = %task_id,
                    cluster = %cluster_name,
                    path,
                    error = %err,
                    "remote precondition never appeared, event dropped"
                );
                return;
            }
        }

        let result = self
            .retry
            .run_if(kind, |_| true, |_attempt| {
                let event = event.clone();
                let ctx = &ctx;
                async move { self.apply(ctx, &event).await }
            })
            .await;

        match result {
            Ok(()) => {
                tracing::info!(kind, task = %task_id, cluster = %cluster_name, "event replicated");
            }
            Err(err) => {
                tracing::error!(
                    kind,
                    task = %task_id,
                    cluster = %cluster_name,
                    error = %err,
                    "event dispatch exhausted retries, event dropped"
                );
            }
        }
    }

    /// Poll until `path` exists on the remote, attempts run out, or the
    /// router is cancelled. Read-only: the remote is never mutated here.
    async fn wait_for_remote(&self, ctx: &ReplicaContext, path: &str) -> Result<()> {
        let metadata = ctx.metadata();
        for attempt in 1..=self.wait.max_attempts {
            if metadata
                .node_exists(&ctx.remote_project, &ctx.remote_repo, path)
                .await?
            {
                return Ok(());
            }
            if attempt < self.wait.max_attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(ReplicaError::Cancelled(
                            "shutdown while waiting for remote path".into(),
                        ));
                    }
                    _ = tokio::time::sleep(self.wait.interval) => {}
                }
            }
        }
        Err(ReplicaError::NotFound(format!(
            "remote path {path} did not appear within {} polls",
            self.wait.max_attempts
        )))
    }

    async fn apply(&self, ctx: &ReplicaContext, event: &DomainEvent) -> Result<()> {
        let metadata = ctx.metadata();
        match event {
            DomainEvent::ProjectCreated { .. } => self.replicator.replica_project(ctx).await,
            DomainEvent::RepoCreated { .. } => {
                self.replicator.replica_project(ctx).await?;
                self.replicator.replica_repo(ctx).await
            }
            DomainEvent::RepoUpdated { project, repo } => {
                let local = self.store.repo(project, repo).await?.ok_or_else(|| {
                    ReplicaError::NotFound(format!("local repo {project}/{repo}"))
                })?;
                metadata
                    .update_repo(
                        &ctx.remote_project,
                        &crate::model::RepoInfo {
                            project: ctx.remote_project.clone(),
                            name: ctx.remote_repo.clone(),
                            repo_type: local.repo_type,
                            description: local.description,
                        },
                    )
                    .await
            }
            DomainEvent::RepoDeleted { .. } => {
                metadata
                    .delete_repo(&ctx.remote_project, &ctx.remote_repo)
                    .await
            }
            DomainEvent::NodeCreated { project, repo, path }
            | DomainEvent::NodeUpdated { project, repo, path } => {
                let node = self.store.node(project, repo, path).await?.ok_or_else(|| {
                    ReplicaError::NotFound(format!("local node {path}"))
                })?;
                if node.folder {
                    self.replicator.replica_dir(ctx, &node).await?;
                } else {
                    self.replicator.replica_file(ctx, &node).await?;
                }
                Ok(())
            }
            DomainEvent::NodeRenamed { path, new_path, .. } => {
                metadata
                    .rename_node(&ctx.remote_project, &ctx.remote_repo, path, new_path)
                    .await
            }
            DomainEvent::NodeMoved { path, target_path, .. } => {
                metadata
                    .move_node(&ctx.remote_project, &ctx.remote_repo, path, target_path)
                    .await
            }
            DomainEvent::NodeCopied { path, target_path, .. } => {
                metadata
                    .copy_node(&ctx.remote_project, &ctx.remote_repo, path, target_path)
                    .await
            }
            DomainEvent::NodeDeleted { path, .. } => {
                metadata
                    .delete_node(&ctx.remote_project, &ctx.remote_repo, path)
                    .await
            }
            DomainEvent::MetadataSaved { path, metadata: map, .. } => {
                metadata
                    .save_node_metadata(&ctx.remote_project, &ctx.remote_repo, path, map)
                    .await
            }
            DomainEvent::MetadataDeleted { path, .. } => {
                metadata
                    .delete_node_metadata(&ctx.remote_project, &ctx.remote_repo, path)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_event(path: &str) -> DomainEvent {
        DomainEvent::NodeRenamed {
            project: "proj".into(),
            repo: "repo".into(),
            path: path.into(),
            new_path: format!("{path}.new"),
        }
    }

    #[test]
    fn precondition_paths() {
        assert_eq!(node_event("a/b").precondition_path(), Some("a/b"));
        let created = DomainEvent::NodeCreated {
            project: "proj".into(),
            repo: "repo".into(),
            path: "a/b".into(),
        };
        assert_eq!(created.precondition_path(), None);
        let project = DomainEvent::ProjectCreated {
            project: "proj".into(),
        };
        assert_eq!(project.precondition_path(), None);
        assert_eq!(project.repo(), None);
    }

    #[test]
    fn event_accessors() {
        let event = node_event("dir/file.bin");
        assert_eq!(event.project(), "proj");
        assert_eq!(event.repo(), Some("repo"));
        assert_eq!(event.kind(), "node_renamed");
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(node_event("x"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind(), "node_renamed");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.publish(node_event("x"));
    }
}
