use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::io::error::IoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub url: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    #[serde(default)]
    pub content_type: Option<String>,
    /// 0 means no explicit timeout.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub cancellation_key: Option<String>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            body: None,
            content_type: None,
            timeout_ms: 0,
            cancellation_key: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn body(mut self, body: Vec<u8>, content_type: impl Into<String>) -> Self {
        self.body = Some(body);
        self.content_type = Some(content_type.into());
        self
    }

    pub fn json<T: Serialize>(self, value: &T) -> Result<Self, IoError> {
        let body = serde_json::to_vec(value).map_err(|e| IoError::InvalidInput(e.to_string()))?;
        Ok(self.body(body, "application/json"))
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn cancellation_key(mut self, key: impl Into<String>) -> Self {
        self.cancellation_key = Some(key.into());
        self
    }

    pub fn validate(&self) -> Result<(), IoError> {
        if self.url.trim().is_empty() {
            return Err(IoError::InvalidInput("request url must not be blank".into()));
        }
        if matches!(self.method, HttpMethod::Get | HttpMethod::Head) && self.body.is_some() {
            return Err(IoError::InvalidInput(format!("{} requests must not carry a body", self.method)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status_code)
    }

    pub fn is_client_error(&self) -> bool {
        (400..=499).contains(&self.status_code)
    }

    pub fn is_server_error(&self) -> bool {
        (500..=599).contains(&self.status_code)
    }

    pub fn body_as_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// One-shot HTTP with per-key cancellation.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, IoError>;

    /// Cancels every in-flight request registered under `key`.
    fn cancel(&self, key: &str);
}

pub struct ReqwestHttpClient {
    client: reqwest::Client,
    inflight: DashMap<String, HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            inflight: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(&self, key: &str) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.inflight.entry(key.to_string()).or_default().insert(id, token.clone());
        (id, token)
    }

    fn unregister(&self, key: &str, id: u64) {
        if let Some(mut calls) = self.inflight.get_mut(key) {
            calls.remove(&id);
        }
        self.inflight.remove_if(key, |_, calls| calls.is_empty());
    }

    async fn perform(&self, request: &HttpRequest) -> Result<HttpResponse, IoError> {
        let url = request.url.as_str();
        let mut builder = self.client.request(request.method.into(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            if let Some(ct) = &request.content_type {
                builder = builder.header(reqwest::header::CONTENT_TYPE, ct.as_str());
            }
            builder = builder.body(body.clone());
        }
        if request.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(request.timeout_ms));
        }

        let response = builder.send().await.map_err(|e| IoError::http(url, e))?;
        let status_code = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| IoError::http(url, e))?.to_vec();

        Ok(HttpResponse {
            status_code,
            headers,
            body,
            content_type,
        })
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(name = "http_execute", skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, IoError> {
        request.validate()?;
        let Some(key) = request.cancellation_key.clone() else {
            return self.perform(&request).await;
        };

        let (id, token) = self.register(&key);
        let result = tokio::select! {
            _ = token.cancelled() => Err(IoError::HttpCancelled(key.clone())),
            r = self.perform(&request) => r,
        };
        self.unregister(&key, id);
        if let Ok(resp) = &result {
            debug!(status = resp.status_code, "http response");
        }
        result
    }

    fn cancel(&self, key: &str) {
        if let Some((_, calls)) = self.inflight.remove(key) {
            debug!(key, count = calls.len(), "cancelling http calls");
            for token in calls.values() {
                token.cancel();
            }
        }
    }
}
