//! Per-run, per-target-cluster execution state.

use crate::cluster::ClusterNode;
use crate::config::ReplicationTask;
use crate::error::Result;
use crate::remote::auth::AuthorizationResolver;
use crate::remote::executor::RequestExecutor;
use crate::remote::metadata::MetadataClient;
use uuid::Uuid;

/// Ephemeral state for one replication run against one target cluster.
/// Owned exclusively by the run that created it and discarded at run end;
/// the HTTP client inside is shared across every request of the run.
pub struct ReplicaContext {
    pub run_id: Uuid,
    pub task: ReplicationTask,
    pub cluster: ClusterNode,
    pub remote_project: String,
    pub remote_repo: String,
    client: reqwest::Client,
}

impl ReplicaContext {
    pub fn new(task: ReplicationTask, cluster: ClusterNode) -> Result<Self> {
        task.transfer.validate()?;
        let client = cluster.http_client()?;
        let remote_project = task.remote_project().to_string();
        let remote_repo = task.remote_repo().to_string();
        Ok(Self {
            run_id: Uuid::new_v4(),
            task,
            cluster,
            remote_project,
            remote_repo,
            client,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Remote repository path component used by the blob plane.
    pub fn repo_path(&self) -> String {
        format!("{}/{}", self.remote_project, self.remote_repo)
    }

    /// Pre-encoded static authorization for the metadata plane.
    pub fn static_authorization(&self) -> Option<String> {
        self.cluster
            .credentials
            .as_ref()
            .map(|creds| creds.basic_header())
    }

    /// Executor carrying the cluster's static credentials.
    pub fn executor(&self) -> RequestExecutor {
        RequestExecutor::new(self.client.clone()).with_authorization(self.static_authorization())
    }

    /// Executor carrying a resolved blob-plane authorization value.
    pub fn executor_with(&self, authorization: String) -> RequestExecutor {
        RequestExecutor::new(self.client.clone()).with_authorization(Some(authorization))
    }

    pub fn metadata(&self) -> MetadataClient {
        MetadataClient::new(self.executor(), self.cluster.base_url())
    }

    pub fn auth_resolver(&self) -> AuthorizationResolver {
        AuthorizationResolver::new(self.client.clone(), self.cluster.base_url())
    }

    /// Resolve the blob-plane authorization once; the caller reuses it
    /// for every blob of the artifact version being pushed.
    pub async fn resolve_blob_authorization(&self) -> Result<String> {
        self.auth_resolver()
            .resolve(&self.repo_path(), self.cluster.credentials.as_ref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictStrategy, ReplicationMode, SourceRef, TransferSettings};

    fn task() -> ReplicationTask {
        ReplicationTask {
            id: "t1".into(),
            source: SourceRef {
                project: "proj".into(),
                repo: "repo".into(),
            },
            targets: vec!["east".into()],
            remote_project: Some("mirror-proj".into()),
            remote_repo: None,
            objects: vec![],
            replicate_all: true,
            conflict_strategy: ConflictStrategy::Overwrite,
            include_metadata: false,
            transfer: TransferSettings::default(),
            mode: ReplicationMode::Scheduled,
        }
    }

    #[test]
    fn context_remaps_identifiers() {
        let ctx =
            ReplicaContext::new(task(), ClusterNode::new("east", "East", "http://east")).unwrap();
        assert_eq!(ctx.remote_project, "mirror-proj");
        assert_eq!(ctx.remote_repo, "repo");
        assert_eq!(ctx.repo_path(), "mirror-proj/repo");
    }

    #[test]
    fn invalid_transfer_settings_are_rejected() {
        let mut bad = task();
        bad.transfer.parallelism = 0;
        let result = ReplicaContext::new(bad, ClusterNode::new("east", "East", "http://east"));
        assert!(result.is_err());
    }
}
