//! HTTP execution seam for the session client.
//!
//! `SessionClient` never talks to `reqwest` directly; it hands a fully built
//! [`HttpRequest`] to an [`HttpBackend`]. Production uses [`ReqwestBackend`],
//! tests substitute scripted backends.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;

use super::SessionError;

const REQUEST_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// A request with URL resolved and headers merged, ready to send.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

/// A response as received; non-2xx statuses are not errors at this layer.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body as text; invalid UTF-8 is replaced rather than rejected.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// JSON value when the body parses, otherwise the raw text as a string.
    #[must_use]
    pub fn json_or_text(&self) -> serde_json::Value {
        if self.body.is_empty() {
            return serde_json::Value::Null;
        }
        self.json::<serde_json::Value>()
            .unwrap_or_else(|_| serde_json::Value::String(self.text()))
    }
}

/// Executes one HTTP exchange.
#[async_trait::async_trait]
pub trait HttpBackend: Send + Sync {
    /// Send `request` and collect the full response.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] only for transport failures (DNS, connect,
    /// timeout, body read). HTTP error statuses are returned as responses.
    async fn execute(&self, request: HttpRequest) -> Result<ApiResponse, SessionError>;
}

/// [`HttpBackend`] over a shared `reqwest::Client`.
#[derive(Clone, Debug)]
pub struct ReqwestBackend {
    client: reqwest::Client,
}

impl ReqwestBackend {
    /// Build a backend with the default timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend fails to initialise.
    pub fn new() -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: HttpRequest) -> Result<ApiResponse, SessionError> {
        let builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        let builder = if let Some(body) = request.body {
            builder.body(body)
        } else {
            builder
        };

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
