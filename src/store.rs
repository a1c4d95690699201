//! Trait seams for the local collaborators the engine consumes.
//!
//! The storage engine, task configuration store, run record store and
//! outbound rate limiter are external subsystems; the engine only sees
//! these interfaces, injected at construction.

use crate::config::ReplicationTask;
use crate::error::Result;
use crate::model::{NodeInfo, PackageVersion, ProjectInfo, RepoInfo};
use crate::progress::{RunProgress, RunRecord, RunStatus};
use async_trait::async_trait;
use uuid::Uuid;

/// Local storage and metadata lookups. Never mutated by the replicator.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn project(&self, project: &str) -> Result<Option<ProjectInfo>>;

    async fn repo(&self, project: &str, repo: &str) -> Result<Option<RepoInfo>>;

    async fn node(&self, project: &str, repo: &str, path: &str) -> Result<Option<NodeInfo>>;

    async fn package_version(
        &self,
        project: &str,
        repo: &str,
        key: &str,
        version: &str,
    ) -> Result<Option<PackageVersion>>;

    /// All versions of a package, for task objects without a version list.
    async fn package_versions(
        &self,
        project: &str,
        repo: &str,
        key: &str,
    ) -> Result<Vec<PackageVersion>>;

    /// Nodes composing one package version, for non-manifest formats.
    async fn version_nodes(
        &self,
        project: &str,
        repo: &str,
        version: &PackageVersion,
    ) -> Result<Vec<NodeInfo>>;

    /// Nodes under a path prefix; empty prefix lists the whole repo.
    async fn list_nodes(&self, project: &str, repo: &str, prefix: &str) -> Result<Vec<NodeInfo>>;

    /// Blob bytes by sha256 digest (with or without the `sha256:` prefix).
    async fn read_blob(&self, sha256: &str) -> Result<Vec<u8>>;
}

/// Task configuration store: which tasks are active for a source repo.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Active tasks for a (project, repo) pair. `repo` is `None` for
    /// project-level events, matching every task under the project.
    async fn active_tasks(&self, project: &str, repo: Option<&str>) -> Result<Vec<ReplicationTask>>;
}

/// Run record persistence: start, progress updates and terminal status.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn start(&self, record: &RunRecord) -> Result<()>;

    async fn update(&self, run_id: Uuid, progress: &RunProgress) -> Result<()>;

    async fn complete(&self, run_id: Uuid, status: RunStatus, progress: &RunProgress) -> Result<()>;
}

/// Outbound byte throttle, acquired once per chunk before it is sent.
/// The rate-limiting subsystem supplies real implementations; tasks carry
/// the configured limit in their transfer settings.
#[async_trait]
pub trait ByteThrottle: Send + Sync {
    async fn acquire(&self, bytes: usize);
}

/// Unlimited throttle used when a task has no rate limit.
pub struct NoThrottle;

#[async_trait]
impl ByteThrottle for NoThrottle {
    async fn acquire(&self, _bytes: usize) {}
}

/// Paces callers to a fixed outbound byte rate. Each acquisition reserves
/// its slice of the timeline; concurrent callers queue behind one another.
pub struct RateThrottle {
    bytes_per_sec: u64,
    next_free: tokio::sync::Mutex<tokio::time::Instant>,
}

impl RateThrottle {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            next_free: tokio::sync::Mutex::new(tokio::time::Instant::now()),
        }
    }
}

#[async_trait]
impl ByteThrottle for RateThrottle {
    async fn acquire(&self, bytes: usize) {
        let wait = {
            let mut next_free = self.next_free.lock().await;
            let now = tokio::time::Instant::now();
            let start = (*next_free).max(now);
            let cost =
                std::time::Duration::from_secs_f64(bytes as f64 / self.bytes_per_sec as f64);
            *next_free = start + cost;
            start.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
