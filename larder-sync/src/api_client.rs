//! HTTP client for the back-office REST API.
//!
//! Every remote call the engine makes (direct façade calls and action-log
//! replay) goes through [`RemoteClient::send`], so a replayed action hits
//! exactly the same method, URL, body and auth header as the direct call.

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use larder_storage::HttpMethod;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Longest slice of an error body kept in [`SyncError::RemoteStatus`].
const MAX_ERROR_BODY: usize = 512;

/// JSON client for the remote service. Share it behind an `Arc`.
pub struct RemoteClient {
    client: Client,
    base_url: String,
    /// Bearer token handed over by the session layer.
    token: Arc<RwLock<Option<String>>>,
}

impl RemoteClient {
    pub fn new(config: &EngineConfig) -> SyncResult<Self> {
        config.validate()?;
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sets or clears the bearer token (login, refresh, logout).
    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    pub async fn has_token(&self) -> bool {
        self.token.read().await.is_some()
    }

    /// Resolves an endpoint: absolute URLs pass through, anything else is
    /// joined onto the base URL.
    pub fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else if endpoint.starts_with('/') {
            format!("{}{endpoint}", self.base_url)
        } else {
            format!("{}/{endpoint}", self.base_url)
        }
    }

    /// Issues one request and decodes the JSON response.
    ///
    /// Transport failures map to [`SyncError::RemoteUnreachable`], non-2xx
    /// statuses to [`SyncError::RemoteStatus`]. An empty or non-JSON success
    /// body comes back as `Value::Null`.
    pub async fn send(
        &self,
        method: HttpMethod,
        endpoint: &str,
        body: Option<&Value>,
    ) -> SyncResult<Value> {
        let url = self.url(endpoint);
        let mut request = self.client.request(reqwest_method(method), &url);
        if let Some(token) = self.token.read().await.as_deref() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| SyncError::RemoteUnreachable(e.to_string()))?;
        let status = resp.status();

        if !status.is_success() {
            let mut message = resp.text().await.unwrap_or_default();
            if message.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| message.is_char_boundary(*i))
                    .unwrap_or(0);
                message.truncate(cut);
            }
            debug!("{method} {url} -> {status}");
            return Err(SyncError::RemoteStatus {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SyncError::RemoteUnreachable(e.to_string()))?;
        debug!("{method} {url} -> {status} ({} bytes)", bytes.len());
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            debug!("non-JSON body from {method} {url}: {e}");
            Value::Null
        }))
    }

    pub async fn get(&self, endpoint: &str) -> SyncResult<Value> {
        self.send(HttpMethod::Get, endpoint, None).await
    }

    pub async fn post(&self, endpoint: &str, body: &Value) -> SyncResult<Value> {
        self.send(HttpMethod::Post, endpoint, Some(body)).await
    }

    pub async fn put(&self, endpoint: &str, body: &Value) -> SyncResult<Value> {
        self.send(HttpMethod::Put, endpoint, Some(body)).await
    }

    pub async fn delete(&self, endpoint: &str) -> SyncResult<Value> {
        self.send(HttpMethod::Delete, endpoint, None).await
    }
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> RemoteClient {
        RemoteClient::new(&EngineConfig {
            api_base_url: base.to_string(),
            ..EngineConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn joins_relative_endpoints() {
        let c = client("http://api.test/");
        assert_eq!(c.url("/api/suppliers"), "http://api.test/api/suppliers");
        assert_eq!(c.url("api/suppliers"), "http://api.test/api/suppliers");
    }

    #[test]
    fn absolute_endpoints_pass_through() {
        let c = client("http://api.test");
        assert_eq!(c.url("https://other.test/x"), "https://other.test/x");
    }

    #[test]
    fn rejects_non_http_base() {
        let result = RemoteClient::new(&EngineConfig {
            api_base_url: "ftp://api.test".into(),
            ..EngineConfig::default()
        });
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
