//! Replication task configuration and tuning policies.

use crate::error::{ReplicaError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Policy applied when the remote target already holds an artifact that a
/// task is about to replicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    /// Leave the remote copy untouched; the unit counts as replicated.
    Skip,
    /// Replace the remote copy.
    Overwrite,
    /// Abort the whole run on the first conflict.
    FastFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMode {
    EventDriven,
    Scheduled,
    RunOnce,
}

/// A package or path constraint carried by a task. A task with no objects
/// and `replicate_all` set replicates the entire repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskObject {
    Package {
        key: String,
        /// `None` replicates every version of the package.
        versions: Option<Vec<String>>,
    },
    Path {
        prefix: String,
    },
}

/// Source (project, repo) pair a task replicates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub project: String,
    pub repo: String,
}

/// Transfer tuning for one task: chunk size, blob parallelism and the
/// outbound rate limit handed to the byte throttle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub parallelism: usize,
    pub rate_limit_bps: Option<u64>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024,
            parallelism: 4,
            rate_limit_bps: None,
        }
    }
}

impl TransferSettings {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ReplicaError::Config("chunk_size must be non-zero".into()));
        }
        if self.parallelism == 0 {
            return Err(ReplicaError::Config("parallelism must be non-zero".into()));
        }
        Ok(())
    }
}

/// An operator-defined replication task. Immutable during a run; many
/// tasks may reference the same source repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub id: String,
    pub source: SourceRef,
    /// Target cluster node ids.
    pub targets: Vec<String>,
    /// Remote project name; defaults to the source project when unset.
    pub remote_project: Option<String>,
    /// Remote repository name; defaults to the source repo when unset.
    pub remote_repo: Option<String>,
    #[serde(default)]
    pub objects: Vec<TaskObject>,
    #[serde(default)]
    pub replicate_all: bool,
    pub conflict_strategy: ConflictStrategy,
    #[serde(default)]
    pub include_metadata: bool,
    #[serde(default)]
    pub transfer: TransferSettings,
    pub mode: ReplicationMode,
}

impl ReplicationTask {
    pub fn remote_project(&self) -> &str {
        self.remote_project.as_deref().unwrap_or(&self.source.project)
    }

    pub fn remote_repo(&self) -> &str {
        self.remote_repo.as_deref().unwrap_or(&self.source.repo)
    }

    pub fn matches(&self, project: &str, repo: &str) -> bool {
        self.source.project == project && self.source.repo == repo
    }
}

/// Explicit retry policy: fixed attempt count, fixed delay, retryable-error
/// predicate supplied by the call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// Run `op` until it succeeds, `pred` rejects the error, or attempts
    /// are exhausted. The closure receives the 1-based attempt number.
    pub async fn run_if<T, F, Fut, P>(&self, what: &str, pred: P, mut op: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&ReplicaError) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if pred(&err) && attempt < attempts => {
                    tracing::warn!(
                        operation = what,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    last = Some(err);
                    sleep(self.delay).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| {
            ReplicaError::Upload(format!("{what}: all {attempts} attempts failed"))
        }))
    }

    /// Retry on transient errors and on errors that downgrade the
    /// transfer protocol (401/405 get a fresh attempt in single-shot mode).
    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(what, |e| e.is_retryable() || e.triggers_downgrade(), op)
            .await
    }
}

/// Bounded existence-poll configuration used before order-dependent
/// remote mutations.
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn conflict_strategy_wire_form() {
        assert_eq!(
            serde_json::to_string(&ConflictStrategy::FastFail).unwrap(),
            r#""FAST_FAIL""#
        );
        let s: ConflictStrategy = serde_json::from_str(r#""SKIP""#).unwrap();
        assert_eq!(s, ConflictStrategy::Skip);
    }

    #[test]
    fn remote_names_default_to_source() {
        let task = ReplicationTask {
            id: "t1".into(),
            source: SourceRef {
                project: "proj".into(),
                repo: "repo".into(),
            },
            targets: vec!["east".into()],
            remote_project: None,
            remote_repo: Some("mirror".into()),
            objects: vec![],
            replicate_all: true,
            conflict_strategy: ConflictStrategy::Skip,
            include_metadata: false,
            transfer: TransferSettings::default(),
            mode: ReplicationMode::Scheduled,
        };
        assert_eq!(task.remote_project(), "proj");
        assert_eq!(task.remote_repo(), "mirror");
        assert!(task.matches("proj", "repo"));
        assert!(!task.matches("proj", "other"));
    }

    #[test]
    fn transfer_settings_validation() {
        assert!(TransferSettings::default().validate().is_ok());
        let bad = TransferSettings {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn retry_policy_retries_transient_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result = policy
            .run("test", |_| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                    Err(ReplicaError::Network("reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_policy_stops_on_terminal_error() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let result: Result<()> = policy
            .run("test", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ReplicaError::NotFound("missing".into()))
            })
            .await;
        assert!(matches!(result, Err(ReplicaError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_policy_exhausts_and_returns_last_error() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let result: Result<()> = policy
            .run_if("test", |_| true, |_| async {
                Err(ReplicaError::Remote("boom".into()))
            })
            .await;
        assert!(matches!(result, Err(ReplicaError::Remote(_))));
    }
}
