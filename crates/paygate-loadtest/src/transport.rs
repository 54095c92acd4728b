//! Transport seam between scenarios and the target service

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::error::{ConfigError, LoadTestError, Result};

/// One HTTP call described independently of the client issuing it
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    /// Path relative to the base URL, starting with `/`
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    pub fn post_json<T: Serialize>(path: impl Into<String>, body: &T) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(serde_json::to_value(body).unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// Why a single HTTP call did not produce a status code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request failed: {0}")]
    Other(String),
}

impl RequestFailure {
    /// Short label for error breakdowns
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Connection(_) => "connection",
            Self::Other(_) => "other",
        }
    }
}

/// Issues HTTP calls against the target service
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request and return the response status code
    async fn send(&self, request: &HttpRequest) -> std::result::Result<u16, RequestFailure>;
}

/// `reqwest`-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for `base_url` with a per-request timeout
    pub fn new(base_url: &str, timeout: Duration, max_idle_per_host: usize) -> Result<Self> {
        validate_base_url(base_url)?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .build()
            .map_err(|e| LoadTestError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn classify(&self, err: reqwest::Error) -> RequestFailure {
        if err.is_timeout() {
            RequestFailure::Timeout(self.timeout)
        } else if err.is_connect() {
            RequestFailure::Connection(err.to_string())
        } else {
            RequestFailure::Other(err.to_string())
        }
    }
}

/// Reject base URLs that are not absolute http(s) URLs
pub fn validate_base_url(base_url: &str) -> std::result::Result<(), ConfigError> {
    let url = Url::parse(base_url).map_err(|e| ConfigError::InvalidBaseUrl {
        url: base_url.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<u16, RequestFailure> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url_for(&request.path));
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status().as_u16();

        // Drain the body so the connection returns to the pool
        response.bytes().await.map_err(|e| self.classify(e))?;

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_url_validation() {
        assert!(validate_base_url("http://localhost:8080/api/v1").is_ok());
        assert!(validate_base_url("https://pay.example.com").is_ok());
        assert!(matches!(
            validate_base_url("localhost:8080"),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            validate_base_url("ftp://example.com"),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn test_url_join() {
        let transport =
            HttpTransport::new("http://localhost:8080/api/v1/", Duration::from_secs(1), 4).unwrap();
        assert_eq!(transport.base_url(), "http://localhost:8080/api/v1");
        assert_eq!(transport.url_for("/health"), "http://localhost:8080/api/v1/health");
    }

    #[test]
    fn test_post_json() {
        let request = HttpRequest::post_json("/query", &json!({"channel": "wechat"}));
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.body.unwrap()["channel"], "wechat");
    }
}
