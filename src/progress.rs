//! Per-run progress and terminal status tracking.

use crate::error::Result;
use crate::store::RunRecorder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Monotonically increasing counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub items_processed: u64,
    pub bytes_sent: u64,
}

/// Identity of one replication run, persisted at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub task_id: String,
    pub cluster_id: String,
    pub started_at: DateTime<Utc>,
}

/// Records per-run progress through the external record store. Counter
/// updates are monotonic; the terminal status is written exactly once.
pub struct ProgressTracker {
    recorder: Arc<dyn RunRecorder>,
    record: RunRecord,
    progress: Mutex<RunProgress>,
}

impl ProgressTracker {
    /// Create the run record and persist its start.
    pub async fn begin(
        recorder: Arc<dyn RunRecorder>,
        task_id: &str,
        cluster_id: &str,
    ) -> Result<Self> {
        let record = RunRecord {
            id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            cluster_id: cluster_id.to_string(),
            started_at: Utc::now(),
        };
        recorder.start(&record).await?;
        Ok(Self {
            recorder,
            record,
            progress: Mutex::new(RunProgress::default()),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.record.id
    }

    /// Count one completed unit. Record-store failures are logged but do
    /// not fail the run; the terminal write at completion is authoritative.
    pub async fn item_done(&self, bytes: u64) {
        let snapshot = {
            let mut progress = self.progress.lock().await;
            progress.items_processed += 1;
            progress.bytes_sent += bytes;
            *progress
        };
        if let Err(err) = self.recorder.update(self.record.id, &snapshot).await {
            tracing::warn!(run_id = %self.record.id, error = %err, "progress update failed");
        }
    }

    pub async fn snapshot(&self) -> RunProgress {
        *self.progress.lock().await
    }

    /// Persist the terminal status.
    pub async fn finish(&self, status: RunStatus) -> Result<()> {
        let snapshot = self.snapshot().await;
        self.recorder
            .complete(self.record.id, status, &snapshot)
            .await
    }
}
