//! Replication payload types sourced from the local storage collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identity and transfer unit for a blob. Content-addressed: identical
/// sha256 is assumed byte-identical and never re-transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub sha256: String,
    pub md5: Option<String>,
    pub size: u64,
}

impl FileInfo {
    /// Registry-form digest, `sha256:<hex>`.
    pub fn digest(&self) -> String {
        if self.sha256.starts_with("sha256:") {
            self.sha256.clone()
        } else {
            format!("sha256:{}", self.sha256)
        }
    }
}

/// A node in the local artifact tree: a file or a folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub path: String,
    pub folder: bool,
    pub size: u64,
    pub sha256: Option<String>,
    pub md5: Option<String>,
    pub crc64: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub created_by: String,
}

impl NodeInfo {
    /// Transfer identity of a file node; folders carry no bytes.
    pub fn file_info(&self) -> Option<FileInfo> {
        if self.folder {
            return None;
        }
        self.sha256.as_ref().map(|sha| FileInfo {
            sha256: sha.clone(),
            md5: self.md5.clone(),
            size: self.size,
        })
    }
}

/// One version of a package, e.g. an image tag or a Helm chart release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageVersion {
    pub key: String,
    pub name: String,
    pub size: u64,
    pub content_path: String,
    pub stage: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

/// The unit a single replication step operates on.
#[derive(Debug, Clone)]
pub enum ArtifactUnit {
    Node(NodeInfo),
    Package(PackageVersion),
}

impl ArtifactUnit {
    /// Human-readable identifier for log records.
    pub fn describe(&self) -> String {
        match self {
            ArtifactUnit::Node(n) => n.path.clone(),
            ArtifactUnit::Package(p) => format!("{}:{}", p.key, p.name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
}

/// Remote repository formats the engine replicates into. Manifest-bearing
/// formats get package-type-specific blob discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoType {
    Generic,
    ContainerImage,
    Helm,
    Conan,
    Nuget,
}

impl RepoType {
    /// Whether versions in this repository are described by a manifest
    /// document that enumerates their blobs.
    pub fn manifest_bearing(&self) -> bool {
        matches!(self, RepoType::ContainerImage)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoInfo {
    pub project: String,
    pub name: String,
    pub repo_type: RepoType,
    pub description: Option<String>,
}
