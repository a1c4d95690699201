//! Metadata-plane operations against a remote cluster.
//!
//! Everything that is not blob bytes goes through here: project and repo
//! creation, node lifecycle (create/rename/move/copy/delete), package
//! version records, node metadata, manifest upload and the engine
//! version probe.

use crate::error::{ReplicaError, Result};
use crate::model::{NodeInfo, PackageVersion, ProjectInfo, RepoInfo};
use crate::remote::executor::{Outcome, RequestExecutor, RequestSpec};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

/// Typed client for the remote metadata plane. One instance per
/// (run, target cluster); requests share the cluster's HTTP client.
#[derive(Clone)]
pub struct MetadataClient {
    executor: RequestExecutor,
    base_url: String,
}

impl MetadataClient {
    pub fn new(executor: RequestExecutor, base_url: impl Into<String>) -> Self {
        Self {
            executor,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn repo_url(&self, project: &str, repo: &str, suffix: &str) -> String {
        self.url(&format!("/api/projects/{project}/repos/{repo}{suffix}"))
    }

    /// Remote engine version, for the warn-only compatibility check.
    pub async fn remote_version(&self) -> Result<String> {
        let spec = RequestSpec::new(Method::GET, self.url("/api/system/version"));
        let response: Option<VersionResponse> = self.executor.execute_json(spec).await?;
        response
            .map(|v| v.version)
            .ok_or_else(|| ReplicaError::Remote("version probe yielded no body".into()))
    }

    pub async fn project_exists(&self, project: &str) -> Result<bool> {
        let spec = RequestSpec::new(Method::GET, self.url(&format!("/api/projects/{project}")))
            .absent_on(&[404]);
        Ok(matches!(self.executor.execute(spec).await?, Outcome::Success(_)))
    }

    pub async fn create_project(&self, project: &ProjectInfo) -> Result<()> {
        let spec = RequestSpec::new(Method::POST, self.url("/api/projects")).json(json!({
            "name": project.name,
            "displayName": project.display_name,
            "description": project.description,
        }));
        self.executor.execute(spec).await?;
        Ok(())
    }

    pub async fn repo_exists(&self, project: &str, repo: &str) -> Result<bool> {
        let spec =
            RequestSpec::new(Method::GET, self.repo_url(project, repo, "")).absent_on(&[404]);
        Ok(matches!(self.executor.execute(spec).await?, Outcome::Success(_)))
    }

    pub async fn create_repo(&self, project: &str, repo: &RepoInfo) -> Result<()> {
        let spec = RequestSpec::new(
            Method::POST,
            self.url(&format!("/api/projects/{project}/repos")),
        )
        .json(json!({
            "name": repo.name,
            "type": repo.repo_type,
            "description": repo.description,
        }));
        self.executor.execute(spec).await?;
        Ok(())
    }

    pub async fn update_repo(&self, project: &str, repo: &RepoInfo) -> Result<()> {
        let spec = RequestSpec::new(Method::PUT, self.repo_url(project, &repo.name, ""))
            .json(json!({
                "type": repo.repo_type,
                "description": repo.description,
            }));
        self.executor.execute(spec).await?;
        Ok(())
    }

    pub async fn delete_repo(&self, project: &str, repo: &str) -> Result<()> {
        let spec = RequestSpec::new(Method::DELETE, self.repo_url(project, repo, ""))
            .absent_on(&[404]);
        self.executor.execute(spec).await?;
        Ok(())
    }

    pub async fn node_exists(&self, project: &str, repo: &str, path: &str) -> Result<bool> {
        let spec = RequestSpec::new(
            Method::HEAD,
            self.repo_url(project, repo, &format!("/nodes?path={}", urlencode(path))),
        )
        .absent_on(&[404]);
        Ok(matches!(self.executor.execute(spec).await?, Outcome::Success(_)))
    }

    /// Create the metadata record for a node whose bytes (if any) have
    /// already been pushed.
    pub async fn create_node(
        &self,
        project: &str,
        repo: &str,
        node: &NodeInfo,
        include_metadata: bool,
    ) -> Result<()> {
        let mut body = json!({
            "path": node.path,
            "folder": node.folder,
            "size": node.size,
            "sha256": node.sha256,
            "md5": node.md5,
            "crc64": node.crc64,
            "created": node.created,
            "modified": node.modified,
            "createdBy": node.created_by,
        });
        if include_metadata {
            body["metadata"] = serde_json::to_value(&node.metadata)?;
        }
        let spec =
            RequestSpec::new(Method::POST, self.repo_url(project, repo, "/nodes")).json(body);
        self.executor.execute(spec).await?;
        Ok(())
    }

    pub async fn rename_node(
        &self,
        project: &str,
        repo: &str,
        path: &str,
        new_path: &str,
    ) -> Result<()> {
        self.node_action(project, repo, "rename", path, new_path).await
    }

    pub async fn move_node(
        &self,
        project: &str,
        repo: &str,
        path: &str,
        target_path: &str,
    ) -> Result<()> {
        self.node_action(project, repo, "move", path, target_path).await
    }

    pub async fn copy_node(
        &self,
        project: &str,
        repo: &str,
        path: &str,
        target_path: &str,
    ) -> Result<()> {
        self.node_action(project, repo, "copy", path, target_path).await
    }

    async fn node_action(
        &self,
        project: &str,
        repo: &str,
        action: &str,
        path: &str,
        target: &str,
    ) -> Result<()> {
        let spec = RequestSpec::new(
            Method::POST,
            self.repo_url(project, repo, &format!("/nodes/{action}")),
        )
        .json(json!({ "path": path, "target": target }));
        self.executor.execute(spec).await?;
        Ok(())
    }

    pub async fn delete_node(&self, project: &str, repo: &str, path: &str) -> Result<()> {
        let spec = RequestSpec::new(
            Method::DELETE,
            self.repo_url(project, repo, &format!("/nodes?path={}", urlencode(path))),
        )
        .absent_on(&[404]);
        self.executor.execute(spec).await?;
        Ok(())
    }

    /// Replace the metadata map attached to a remote node.
    pub async fn save_node_metadata(
        &self,
        project: &str,
        repo: &str,
        path: &str,
        metadata: &std::collections::HashMap<String, String>,
    ) -> Result<()> {
        let spec = RequestSpec::new(
            Method::PATCH,
            self.repo_url(project, repo, &format!("/nodes/metadata?path={}", urlencode(path))),
        )
        .json(serde_json::to_value(metadata)?);
        self.executor.execute(spec).await?;
        Ok(())
    }

    pub async fn delete_node_metadata(
        &self,
        project: &str,
        repo: &str,
        path: &str,
    ) -> Result<()> {
        let spec = RequestSpec::new(
            Method::DELETE,
            self.repo_url(project, repo, &format!("/nodes/metadata?path={}", urlencode(path))),
        )
        .absent_on(&[404]);
        self.executor.execute(spec).await?;
        Ok(())
    }

    pub async fn package_version_exists(
        &self,
        project: &str,
        repo: &str,
        key: &str,
        version: &str,
    ) -> Result<bool> {
        let spec = RequestSpec::new(
            Method::GET,
            self.repo_url(
                project,
                repo,
                &format!("/packages/{}/versions/{}", urlencode(key), urlencode(version)),
            ),
        )
        .absent_on(&[404]);
        Ok(matches!(self.executor.execute(spec).await?, Outcome::Success(_)))
    }

    /// Create the package-version record. Must run only after every blob
    /// of the version landed remotely.
    pub async fn create_package_version(
        &self,
        project: &str,
        repo: &str,
        version: &PackageVersion,
        include_metadata: bool,
    ) -> Result<()> {
        let mut body = json!({
            "key": version.key,
            "name": version.name,
            "size": version.size,
            "contentPath": version.content_path,
            "stage": version.stage,
            "extensions": version.extensions,
        });
        if include_metadata {
            body["metadata"] = serde_json::to_value(&version.metadata)?;
        }
        let spec = RequestSpec::new(
            Method::POST,
            self.repo_url(
                project,
                repo,
                &format!("/packages/{}/versions", urlencode(&version.key)),
            ),
        )
        .json(body);
        self.executor.execute(spec).await?;
        Ok(())
    }

    /// Upload a manifest under its declared media type. Last step of a
    /// manifest-bearing version: its presence marks the version pullable.
    pub async fn put_manifest(
        &self,
        repository: &str,
        version: &str,
        media_type: &str,
        manifest: Vec<u8>,
    ) -> Result<()> {
        let url = format!("{}/v2/{repository}/manifests/{version}", self.base_url);
        let spec = RequestSpec::new(Method::PUT, url)
            .bytes(media_type, manifest)
            .ok_on(&[200, 201, 202]);
        self.executor.execute(spec).await?;
        Ok(())
    }
}

fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}
