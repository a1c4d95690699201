//! Remote cluster descriptors and per-cluster HTTP client construction.

use crate::error::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::HashMap;
use std::time::Duration;

/// Static credentials configured for a cluster node.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Pre-encoded `Authorization` header value for the metadata plane.
    pub fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", BASE64.encode(raw))
    }
}

/// A remote cluster endpoint. Read-only reference data; the composition
/// root owns the directory of known nodes.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub id: String,
    pub name: String,
    base_url: String,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl ClusterNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, base_url: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: None,
            connect_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(3600),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Join a path onto the cluster base URL.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Build the HTTP client reused for every request against this
    /// cluster. One client per cluster per run, never per request.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .pool_idle_timeout(Duration::from_secs(300))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("cluster-replicator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(client)
    }
}

/// Directory of known cluster nodes, keyed by id.
#[derive(Debug, Default)]
pub struct ClusterDirectory {
    nodes: HashMap<String, ClusterNode>,
}

impl ClusterDirectory {
    pub fn new(nodes: impl IntoIterator<Item = ClusterNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ClusterNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
