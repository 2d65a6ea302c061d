//! HTTP backend speaking PostgREST-style table URLs.
//!
//! Rows live under `{base}/rest/v1/{topic}`; a scope becomes a `column=eq.value`
//! filter. Push subscriptions are not available over plain HTTP, so
//! `RestBackend` implements only the request/response half.

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, Client, Method, RequestBuilder};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Backend, WriteOp, WriteRequest};
use crate::cache::{QueryKey, Topic};
use crate::config::SyncConfig;
use crate::error::BackendError;
use crate::models::QueryData;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            api_key: None,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, BackendError> {
        let base_url = config
            .backend_url
            .clone()
            .ok_or_else(|| BackendError::InvalidResponse("backend_url is not configured".into()))?;
        let mut backend = Self::new(base_url, config.request_timeout())?;
        backend.api_key = config.api_key.clone();
        Ok(backend)
    }

    fn table_url(&self, topic: &Topic) -> String {
        format!("{}/rest/v1/{}", self.base_url, topic)
    }

    fn query_params(key: &QueryKey) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        if let Some(filter) = key.scope.to_query_param() {
            params.push(filter);
        }
        params
    }

    fn id_param(id: &str) -> (String, String) {
        ("id".to_string(), format!("eq.{}", id))
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, BackendError> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref key) = self.api_key {
            headers.insert("apikey", Self::header_value(key)?);
            headers.insert(
                header::AUTHORIZATION,
                Self::header_value(&format!("Bearer {}", key))?,
            );
        }
        Ok(headers)
    }

    fn header_value(value: &str) -> Result<header::HeaderValue, BackendError> {
        header::HeaderValue::from_str(value)
            .map_err(|e| BackendError::InvalidResponse(format!("invalid header value: {}", e)))
    }

    /// Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, BackendError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(BackendError::from_status(status, &body))
        }
    }

    /// Send a request built by `build`, backing off on 429.
    async fn send<F>(&self, url: &str, build: F) -> Result<reqwest::Response, BackendError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build(&self.client)
                .headers(self.auth_headers()?)
                .send()
                .await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(BackendError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    async fn fetch_rows(&self, key: &QueryKey) -> Result<QueryData, BackendError> {
        let url = self.table_url(&key.topic);
        let params = Self::query_params(key);
        let response = self.send(&url, |client| client.get(&url).query(&params)).await?;

        let text = response.text().await?;
        debug!(key = %key, bytes = text.len(), "Query response received");

        let rows: Vec<Value> = serde_json::from_str(&text)
            .map_err(|e| BackendError::InvalidResponse(format!("{} response: {}", key, e)))?;
        QueryData::from_rows(&key.topic, rows)
    }

    async fn send_write(&self, request: &WriteRequest) -> Result<(), BackendError> {
        let url = self.table_url(&request.topic);
        let (method, params, body) = match &request.op {
            WriteOp::Insert(row) => (Method::POST, Vec::new(), Some(row)),
            WriteOp::Update { id, patch } => (Method::PATCH, vec![Self::id_param(id)], Some(patch)),
            WriteOp::Delete { id } => (Method::DELETE, vec![Self::id_param(id)], None),
        };

        self.send(&url, |client| {
            let builder = client
                .request(method.clone(), &url)
                .query(&params)
                .header("Prefer", "return=minimal");
            match body {
                Some(body) => builder.json(body),
                None => builder,
            }
        })
        .await?;

        debug!(topic = %request.topic, method = %method, "Write accepted");
        Ok(())
    }
}

impl Backend for RestBackend {
    fn query(&self, key: &QueryKey) -> BoxFuture<'static, Result<QueryData, BackendError>> {
        let backend = self.clone();
        let key = key.clone();
        async move { backend.fetch_rows(&key).await }.boxed()
    }

    fn write(&self, request: WriteRequest) -> BoxFuture<'static, Result<(), BackendError>> {
        let backend = self.clone();
        async move { backend.send_write(&request).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> RestBackend {
        RestBackend::new("https://db.example.com/", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_table_url_trims_trailing_slash() {
        assert_eq!(
            backend().table_url(&Topic::COLLECTIONS),
            "https://db.example.com/rest/v1/collections"
        );
    }

    #[test]
    fn test_query_params_include_scope_filter() {
        let params = RestBackend::query_params(&QueryKey::scoped(Topic::TENANTS, "agent_id", "a1"));
        assert_eq!(
            params,
            vec![
                ("select".to_string(), "*".to_string()),
                ("agent_id".to_string(), "eq.a1".to_string()),
            ]
        );
        assert_eq!(RestBackend::query_params(&QueryKey::all(Topic::TENANTS)).len(), 1);
    }

    #[test]
    fn test_auth_headers() {
        let mut plain = backend();
        assert!(plain.auth_headers().unwrap().is_empty());

        plain.api_key = Some("anon".into());
        let headers = plain.auth_headers().unwrap();
        assert_eq!(headers.get("apikey").unwrap(), "anon");
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer anon");
    }

    #[test]
    fn test_from_config_requires_url() {
        let config = SyncConfig::default();
        assert!(RestBackend::from_config(&config).is_err());

        let config = SyncConfig {
            backend_url: Some("http://localhost:54321".into()),
            api_key: Some("k".into()),
            ..SyncConfig::default()
        };
        let backend = RestBackend::from_config(&config).unwrap();
        assert_eq!(backend.table_url(&Topic::PROFILES), "http://localhost:54321/rest/v1/profiles");
    }
}
