//! Bearer-token authorization for the remote blob plane.
//!
//! The resolver issues a credential-less probe against the registry root,
//! parses the `Www-Authenticate` challenge and exchanges it for a bearer
//! token at the advertised auth service. Tokens are not cached: each
//! artifact-version push resolves authorization once and reuses the value
//! for all blobs of that version.

use crate::cluster::Credentials;
use crate::error::{ReplicaError, Result};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub service: String,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

/// Parse a `Bearer realm="...",service="...",scope="..."` challenge.
pub(crate) fn parse_challenge(header: &str) -> Option<AuthChallenge> {
    let params_str = header.strip_prefix("Bearer ")?;

    let mut params = HashMap::new();
    for param in params_str.split(',') {
        let param = param.trim();
        if let Some(eq) = param.find('=') {
            let key = param[..eq].trim();
            let value = param[eq + 1..].trim().trim_matches('"');
            params.insert(key, value);
        }
    }

    let realm = params.get("realm")?;
    Some(AuthChallenge {
        realm: realm.to_string(),
        service: params.get("service").unwrap_or(&"").to_string(),
        scope: params.get("scope").map(|s| s.to_string()),
    })
}

/// Obtains `Bearer <token>` values for one remote cluster's blob plane.
#[derive(Clone)]
pub struct AuthorizationResolver {
    client: Client,
    base_url: String,
}

impl AuthorizationResolver {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Resolve the authorization value for pushes into `repository`.
    ///
    /// A 200 probe means the registry requires no auth and yields an empty
    /// value; a 401 with a Bearer challenge is exchanged for a token; any
    /// other response is a configuration error.
    pub async fn resolve(
        &self,
        repository: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String> {
        let url = format!("{}/v2/", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ReplicaError::Network(format!("auth probe failed: {e}")))?;

        match response.status().as_u16() {
            200 => Ok(String::new()),
            401 => {
                let header = response
                    .headers()
                    .get("www-authenticate")
                    .ok_or_else(|| {
                        ReplicaError::Config(
                            "401 probe response without Www-Authenticate header".into(),
                        )
                    })?
                    .to_str()
                    .map_err(|e| ReplicaError::Parse(format!("invalid auth header: {e}")))?;

                let challenge = parse_challenge(header).ok_or_else(|| {
                    ReplicaError::Config(format!("unsupported auth challenge: {header}"))
                })?;
                self.exchange(&challenge, repository, credentials).await
            }
            status => Err(ReplicaError::Config(format!(
                "unexpected auth probe status {status} from {url}"
            ))),
        }
    }

    async fn exchange(
        &self,
        challenge: &AuthChallenge,
        repository: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{repository}:pull,push"));

        tracing::debug!(
            realm = %challenge.realm,
            service = %challenge.service,
            scope = %scope,
            "exchanging auth challenge for bearer token"
        );

        let mut request = self.client.get(&challenge.realm).query(&[
            ("service", challenge.service.as_str()),
            ("scope", scope.as_str()),
        ]);
        if let Some(creds) = credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReplicaError::Network(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ReplicaError::Auth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| ReplicaError::Parse(format!("token response: {e}")))?;

        let token = token_response
            .token
            .or(token_response.access_token)
            .ok_or_else(|| ReplicaError::Auth("token response carried no token".into()))?;

        Ok(format!("Bearer {token}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;
    use httpmock::prelude::*;

    #[test]
    fn parses_full_challenge() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:lib/app:push""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service, "registry.example.com");
        assert_eq!(challenge.scope.as_deref(), Some("repository:lib/app:push"));
    }

    #[test]
    fn parses_challenge_without_scope() {
        let challenge =
            parse_challenge(r#"Bearer realm="https://auth.example.com/token",service="reg""#)
                .unwrap();
        assert_eq!(challenge.scope, None);
    }

    #[test]
    fn rejects_non_bearer_and_missing_realm() {
        assert!(parse_challenge(r#"Basic realm="x""#).is_none());
        assert!(parse_challenge(r#"Bearer service="reg""#).is_none());
    }

    #[tokio::test]
    async fn open_registry_yields_empty_token() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/");
                then.status(200);
            })
            .await;

        let resolver = AuthorizationResolver::new(Client::new(), server.base_url());
        let value = resolver.resolve("proj/repo", None).await.unwrap();
        assert!(value.is_empty());
    }

    #[tokio::test]
    async fn challenge_is_exchanged_for_bearer_token() {
        let server = MockServer::start_async().await;
        let challenge = format!(
            r#"Bearer realm="{}",service="registry""#,
            server.url("/token")
        );
        server
            .mock_async(move |when, then| {
                when.method(GET).path("/v2/");
                then.status(401).header("Www-Authenticate", challenge);
            })
            .await;
        let token_mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/token")
                    .query_param("service", "registry")
                    .query_param("scope", "repository:proj/repo:pull,push");
                then.status(200)
                    .json_body(serde_json::json!({ "token": "abc123" }));
            })
            .await;

        let resolver = AuthorizationResolver::new(Client::new(), server.base_url());
        let value = resolver.resolve("proj/repo", None).await.unwrap();
        assert_eq!(value, "Bearer abc123");
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn unexpected_probe_status_is_config_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/");
                then.status(500);
            })
            .await;

        let resolver = AuthorizationResolver::new(Client::new(), server.base_url());
        let err = resolver.resolve("proj/repo", None).await.unwrap_err();
        assert!(matches!(err, ReplicaError::Config(_)));
    }
}
