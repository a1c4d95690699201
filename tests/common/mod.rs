//! In-memory collaborator fakes shared by the integration tests.

use async_trait::async_trait;
use chrono::Utc;
use cluster_replicator::config::{
    ConflictStrategy, ReplicationMode, ReplicationTask, SourceRef, TransferSettings,
};
use cluster_replicator::error::{ReplicaError, Result};
use cluster_replicator::model::{NodeInfo, PackageVersion, ProjectInfo, RepoInfo, RepoType};
use cluster_replicator::progress::{RunProgress, RunRecord, RunStatus};
use cluster_replicator::store::{ArtifactStore, RunRecorder, TaskSource};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn file_node(path: &str, data: &[u8]) -> NodeInfo {
    NodeInfo {
        path: path.to_string(),
        folder: false,
        size: data.len() as u64,
        sha256: Some(sha256_hex(data)),
        md5: None,
        crc64: None,
        metadata: HashMap::new(),
        created: Utc::now(),
        modified: Utc::now(),
        created_by: "tester".into(),
    }
}

pub fn package_version(key: &str, name: &str, size: u64) -> PackageVersion {
    PackageVersion {
        key: key.to_string(),
        name: name.to_string(),
        size,
        content_path: format!("{key}/{name}"),
        stage: None,
        metadata: HashMap::new(),
        extensions: serde_json::Map::new(),
    }
}

pub fn task(strategy: ConflictStrategy, mode: ReplicationMode) -> ReplicationTask {
    ReplicationTask {
        id: "task-1".into(),
        source: SourceRef {
            project: "proj".into(),
            repo: "repo".into(),
        },
        targets: vec!["east".into()],
        remote_project: None,
        remote_repo: None,
        objects: vec![],
        replicate_all: false,
        conflict_strategy: strategy,
        include_metadata: false,
        transfer: TransferSettings::default(),
        mode,
    }
}

/// Read-only artifact tree with a single project and repository.
pub struct MemoryStore {
    pub project: ProjectInfo,
    pub repo: RepoInfo,
    pub nodes: Vec<NodeInfo>,
    pub versions: Vec<PackageVersion>,
    /// Blob bytes keyed by bare hex sha256.
    pub blobs: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new(repo_type: RepoType) -> Self {
        Self {
            project: ProjectInfo {
                name: "proj".into(),
                display_name: "Project".into(),
                description: None,
            },
            repo: RepoInfo {
                project: "proj".into(),
                name: "repo".into(),
                repo_type,
                description: None,
            },
            nodes: Vec::new(),
            versions: Vec::new(),
            blobs: HashMap::new(),
        }
    }

    /// Register a file node and its blob bytes in one step.
    pub fn add_file(&mut self, path: &str, data: &[u8]) -> NodeInfo {
        let node = file_node(path, data);
        self.blobs.insert(sha256_hex(data), data.to_vec());
        self.nodes.push(node.clone());
        node
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn project(&self, project: &str) -> Result<Option<ProjectInfo>> {
        Ok((project == self.project.name).then(|| self.project.clone()))
    }

    async fn repo(&self, project: &str, repo: &str) -> Result<Option<RepoInfo>> {
        Ok((project == self.repo.project && repo == self.repo.name).then(|| self.repo.clone()))
    }

    async fn node(&self, _project: &str, _repo: &str, path: &str) -> Result<Option<NodeInfo>> {
        Ok(self.nodes.iter().find(|n| n.path == path).cloned())
    }

    async fn package_version(
        &self,
        _project: &str,
        _repo: &str,
        key: &str,
        version: &str,
    ) -> Result<Option<PackageVersion>> {
        Ok(self
            .versions
            .iter()
            .find(|v| v.key == key && v.name == version)
            .cloned())
    }

    async fn package_versions(
        &self,
        _project: &str,
        _repo: &str,
        key: &str,
    ) -> Result<Vec<PackageVersion>> {
        Ok(self
            .versions
            .iter()
            .filter(|v| v.key == key)
            .cloned()
            .collect())
    }

    async fn version_nodes(
        &self,
        _project: &str,
        _repo: &str,
        version: &PackageVersion,
    ) -> Result<Vec<NodeInfo>> {
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.path.starts_with(&version.content_path))
            .cloned()
            .collect())
    }

    async fn list_nodes(&self, _project: &str, _repo: &str, prefix: &str) -> Result<Vec<NodeInfo>> {
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.path.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn read_blob(&self, sha256: &str) -> Result<Vec<u8>> {
        let bare = sha256.strip_prefix("sha256:").unwrap_or(sha256);
        self.blobs
            .get(bare)
            .cloned()
            .ok_or_else(|| ReplicaError::Storage(format!("no blob {sha256}")))
    }
}

/// Fixed task list filtered the way the configuration store would.
pub struct MemoryTasks {
    pub tasks: Vec<ReplicationTask>,
}

#[async_trait]
impl TaskSource for MemoryTasks {
    async fn active_tasks(
        &self,
        project: &str,
        repo: Option<&str>,
    ) -> Result<Vec<ReplicationTask>> {
        Ok(self
            .tasks
            .iter()
            .filter(|t| {
                t.source.project == project && repo.is_none_or(|r| t.source.repo == r)
            })
            .cloned()
            .collect())
    }
}

/// Captures every run-record write for later assertions.
#[derive(Default)]
pub struct MemoryRecorder {
    pub starts: Mutex<Vec<RunRecord>>,
    pub updates: Mutex<Vec<RunProgress>>,
    pub completions: Mutex<Vec<(Uuid, RunStatus, RunProgress)>>,
}

#[async_trait]
impl RunRecorder for MemoryRecorder {
    async fn start(&self, record: &RunRecord) -> Result<()> {
        self.starts.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn update(&self, _run_id: Uuid, progress: &RunProgress) -> Result<()> {
        self.updates.lock().unwrap().push(*progress);
        Ok(())
    }

    async fn complete(
        &self,
        run_id: Uuid,
        status: RunStatus,
        progress: &RunProgress,
    ) -> Result<()> {
        self.completions
            .lock()
            .unwrap()
            .push((run_id, status, *progress));
        Ok(())
    }
}
