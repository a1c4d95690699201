//! Generic single-request executor.
//!
//! Every remote call declares its method, headers, body, the status codes
//! that count as success and the codes that mean "absent" rather than
//! failure. Anything else is classified into the engine error taxonomy in
//! one place, so the protocol code never matches on raw status numbers.

use crate::error::{ReplicaError, Result};
use reqwest::{Client, Method, Response};

/// Request body variants the engine sends.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Bytes {
        content_type: String,
        data: Vec<u8>,
    },
}

/// Declarative description of one remote request.
#[derive(Debug)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<RequestBody>,
    /// Status codes treated as success. Empty means any 2xx/3xx-success.
    pub ok: Vec<u16>,
    /// Status codes mapped to `Outcome::Absent` instead of an error.
    pub absent: Vec<u16>,
}

impl RequestSpec {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            ok: Vec::new(),
            absent: Vec::new(),
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(value));
        self
    }

    pub fn bytes(mut self, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.body = Some(RequestBody::Bytes {
            content_type: content_type.into(),
            data,
        });
        self
    }

    pub fn ok_on(mut self, codes: &[u16]) -> Self {
        self.ok = codes.to_vec();
        self
    }

    pub fn absent_on(mut self, codes: &[u16]) -> Self {
        self.absent = codes.to_vec();
        self
    }
}

/// Result of a request whose "not there" responses are expected.
#[derive(Debug)]
pub enum Outcome {
    Success(Response),
    Absent,
}

/// Sends declared requests over a shared per-cluster client, applying the
/// resolved authorization to every call.
#[derive(Clone)]
pub struct RequestExecutor {
    client: Client,
    authorization: Option<String>,
}

impl RequestExecutor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            authorization: None,
        }
    }

    /// Set the `Authorization` header value for subsequent requests.
    /// An empty string means the remote requires no authorization.
    pub fn with_authorization(mut self, value: Option<String>) -> Self {
        self.authorization = value.filter(|v| !v.is_empty());
        self
    }

    pub async fn execute(&self, spec: RequestSpec) -> Result<Outcome> {
        let mut request = self.client.request(spec.method.clone(), &spec.url);

        if let Some(auth) = &self.authorization {
            request = request.header("Authorization", auth);
        }
        for (name, value) in &spec.headers {
            request = request.header(*name, value);
        }
        request = match spec.body {
            Some(RequestBody::Json(value)) => request.json(&value),
            Some(RequestBody::Bytes { content_type, data }) => {
                let len = data.len();
                request
                    .header("Content-Type", content_type)
                    .header("Content-Length", len.to_string())
                    .body(data)
            }
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ReplicaError::Network(format!("timeout calling {}: {e}", spec.url))
            } else if e.is_connect() {
                ReplicaError::Network(format!("connect failure calling {}: {e}", spec.url))
            } else {
                ReplicaError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if spec.absent.contains(&status) {
            return Ok(Outcome::Absent);
        }
        let ok = if spec.ok.is_empty() {
            response.status().is_success()
        } else {
            spec.ok.contains(&status)
        };
        if ok {
            return Ok(Outcome::Success(response));
        }

        let url = spec.url;
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(classify(status, &url, &body))
    }

    /// Execute and deserialize a JSON response. `Absent` maps to `None`.
    pub async fn execute_json<T: serde::de::DeserializeOwned>(
        &self,
        spec: RequestSpec,
    ) -> Result<Option<T>> {
        match self.execute(spec).await? {
            Outcome::Success(response) => {
                let value = response
                    .json::<T>()
                    .await
                    .map_err(|e| ReplicaError::Parse(format!("response body: {e}")))?;
                Ok(Some(value))
            }
            Outcome::Absent => Ok(None),
        }
    }
}

/// Map an unexpected status into the error taxonomy.
fn classify(status: u16, url: &str, body: &str) -> ReplicaError {
    match status {
        401 => ReplicaError::Auth(format!("{url} returned 401: {body}")),
        403 => ReplicaError::Auth(format!("{url} returned 403: {body}")),
        404 => ReplicaError::NotFound(format!("{url} returned 404: {body}")),
        405 => ReplicaError::MethodNotAllowed(format!("{url} returned 405: {body}")),
        409 => ReplicaError::Conflict(format!("{url} returned 409: {body}")),
        status => ReplicaError::Remote(format!("{url} returned {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::HEAD;
    use httpmock::MockServer;
    use httpmock::prelude::*;
    use reqwest::Method;

    #[tokio::test]
    async fn absent_codes_do_not_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/missing");
                then.status(404);
            })
            .await;

        let executor = RequestExecutor::new(Client::new());
        let outcome = executor
            .execute(
                RequestSpec::new(Method::HEAD, server.url("/missing")).absent_on(&[404]),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Absent));
    }

    #[tokio::test]
    async fn unexpected_statuses_are_classified() {
        let server = MockServer::start_async().await;
        for (path, status) in [("/auth", 401), ("/verb", 405), ("/gone", 404), ("/dup", 409)] {
            let p = path.to_string();
            server
                .mock_async(move |when, then| {
                    when.method(GET).path(p);
                    then.status(status);
                })
                .await;
        }

        let executor = RequestExecutor::new(Client::new());
        let err = |path: &str| {
            let executor = executor.clone();
            let url = server.url(path);
            async move {
                executor
                    .execute(RequestSpec::new(Method::GET, url))
                    .await
                    .unwrap_err()
            }
        };
        assert!(matches!(err("/auth").await, ReplicaError::Auth(_)));
        assert!(matches!(
            err("/verb").await,
            ReplicaError::MethodNotAllowed(_)
        ));
        assert!(matches!(err("/gone").await, ReplicaError::NotFound(_)));
        assert!(matches!(err("/dup").await, ReplicaError::Conflict(_)));
    }

    #[tokio::test]
    async fn authorization_header_is_applied() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/secured")
                    .header("Authorization", "Bearer token-1");
                then.status(200);
            })
            .await;

        let executor =
            RequestExecutor::new(Client::new()).with_authorization(Some("Bearer token-1".into()));
        executor
            .execute(RequestSpec::new(Method::GET, server.url("/secured")))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn empty_authorization_sends_no_header() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/open").header_missing("Authorization");
                then.status(200);
            })
            .await;

        let executor = RequestExecutor::new(Client::new()).with_authorization(Some(String::new()));
        executor
            .execute(RequestSpec::new(Method::GET, server.url("/open")))
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
