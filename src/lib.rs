//! Cross-cluster replication engine for artifact repositories.
//!
//! Replicates projects, repositories, package versions and their
//! content-addressed blobs from a local artifact store into remote
//! clusters, either event-driven (mirroring tree mutations as they
//! happen) or as scheduled full runs. Blob bytes travel over a chunked
//! upload protocol with a single-shot fallback; metadata records are
//! written only after their bytes have landed, so remote readers never
//! observe a version whose content is incomplete.
//!
//! The engine owns no storage and no scheduler. The local store, task
//! configuration, run records and the outbound rate limiter are
//! injected through the traits in [`store`].

pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod manifest;
pub mod model;
pub mod progress;
pub mod remote;
pub mod replicate;
pub mod store;

pub use cluster::{ClusterDirectory, ClusterNode, Credentials};
pub use config::{
    ConflictStrategy, ReplicationMode, ReplicationTask, RetryPolicy, SourceRef, TaskObject,
    TransferSettings, WaitPolicy,
};
pub use error::{ReplicaError, Result};
pub use events::{DomainEvent, EventBus, EventRouter};
pub use manifest::ManifestInspector;
pub use progress::{ProgressTracker, RunProgress, RunRecord, RunStatus};
pub use replicate::{
    ClusterReplicator, ReplicaContext, Replicator, RunSummary, ScheduledReplicator, UnitOutcome,
};
pub use store::{ArtifactStore, ByteThrottle, NoThrottle, RateThrottle, RunRecorder, TaskSource};
