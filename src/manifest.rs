//! Package-type-specific blob discovery for manifest-bearing versions.
//!
//! Container-image versions are described by a manifest document listing
//! the config and layer blobs that compose them. The inspector loads the
//! manifest node, covering both the current and the legacy path
//! convention, and yields every digest the version needs remotely. The
//! manifest itself ships last: its presence is the signal that the
//! version is complete and pullable.

use crate::error::{ReplicaError, Result};
use crate::model::{FileInfo, PackageVersion};
use crate::store::ArtifactStore;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDescriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

impl ManifestDescriptor {
    pub fn file_info(&self) -> FileInfo {
        FileInfo {
            sha256: self.digest.clone(),
            md5: None,
            size: self.size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: ManifestDescriptor,
    pub layers: Vec<ManifestDescriptor>,
}

impl ImageManifest {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != 2 {
            return Err(ReplicaError::Parse(format!(
                "unsupported manifest schema version {}",
                self.schema_version
            )));
        }
        if self.layers.is_empty() {
            return Err(ReplicaError::Parse(
                "manifest must declare at least one layer".into(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to replicate one manifest-bearing version: the blob
/// descriptors to push first and the manifest document to push last.
#[derive(Debug, Clone)]
pub struct VersionManifest {
    pub descriptors: Vec<ManifestDescriptor>,
    /// Local node path the manifest was found at.
    pub manifest_path: String,
    pub media_type: String,
    pub raw: Vec<u8>,
}

/// Resolves the full blob set for a package version from its manifest.
pub struct ManifestInspector {
    store: Arc<dyn ArtifactStore>,
}

impl ManifestInspector {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }

    fn current_path(version: &PackageVersion) -> String {
        format!("{}/{}/manifest.json", version.key, version.name)
    }

    fn legacy_path(version: &PackageVersion) -> String {
        format!("{}__{}/manifest.json", version.key, version.name)
    }

    pub async fn inspect(
        &self,
        project: &str,
        repo: &str,
        version: &PackageVersion,
    ) -> Result<VersionManifest> {
        let (node, manifest_path) = self.locate(project, repo, version).await?;
        let sha256 = node.sha256.ok_or_else(|| {
            ReplicaError::Parse(format!("manifest node {manifest_path} carries no digest"))
        })?;
        let raw = self.store.read_blob(&sha256).await?;

        let manifest: ImageManifest = serde_json::from_slice(&raw).map_err(|e| {
            ReplicaError::Parse(format!("manifest {manifest_path}: {e}"))
        })?;
        manifest.validate()?;

        // Config first, then layers; the caller pushes the manifest last.
        let mut descriptors = Vec::with_capacity(manifest.layers.len() + 1);
        descriptors.push(manifest.config.clone());
        descriptors.extend(manifest.layers.iter().cloned());

        Ok(VersionManifest {
            descriptors,
            manifest_path,
            media_type: manifest.media_type,
            raw,
        })
    }

    /// Repositories migrated between manifest layouts; fall back from the
    /// current convention to the legacy one before giving up.
    async fn locate(
        &self,
        project: &str,
        repo: &str,
        version: &PackageVersion,
    ) -> Result<(crate::model::NodeInfo, String)> {
        let current = Self::current_path(version);
        if let Some(node) = self.store.node(project, repo, &current).await? {
            return Ok((node, current));
        }
        let legacy = Self::legacy_path(version);
        if let Some(node) = self.store.node(project, repo, &legacy).await? {
            tracing::debug!(
                package = %version.key,
                version = %version.name,
                path = %legacy,
                "manifest found at legacy location"
            );
            return Ok((node, legacy));
        }
        Err(ReplicaError::NotFound(format!(
            "no manifest for {}:{} at {current} or {legacy}",
            version.key, version.name
        )))
    }
}
