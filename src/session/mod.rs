//! Authenticated HTTP with transparent access-token refresh.
//!
//! ARCHITECTURE
//! ============
//! Every call goes through [`SessionClient::authenticated_request`], which
//! attaches the stored bearer token. A 401 sends the caller through the
//! [`RefreshCoordinator`]: one caller refreshes, the rest wait for its outcome,
//! and each replays its own request once with the new token.
//!
//! A failed refresh is terminal for the session: tokens are cleared and the
//! [`SessionListener`] is told to return the user to sign-in. The caller sees
//! the refresh error; nothing else is retried.
//!
//! The refresh endpoint takes the refresh token as a query parameter
//! (`POST /api/auth/refresh?refreshToken=…`) to match the backend contract.

pub mod coordinator;
pub mod http;
pub mod store;

use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;

pub use coordinator::RefreshCoordinator;
use coordinator::Ticket;
pub use http::{ApiResponse, HttpBackend, HttpRequest, ReqwestBackend};
pub use store::{FileTokenStore, MemoryTokenStore, SessionTokens, StoreError, TokenKey, TokenStore};

/// Path of the token refresh endpoint, relative to the API origin.
pub const REFRESH_PATH: &str = "/api/auth/refresh";

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Why a refresh failed. Cloneable so one outcome reaches every waiter.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("no refresh token stored")]
    MissingRefreshToken,
    #[error("refresh rejected with HTTP {status}")]
    Rejected { status: u16 },
    #[error("refresh request failed: {0}")]
    Network(String),
    #[error("refresh response invalid: {0}")]
    InvalidResponse(String),
    #[error("token store failed during refresh: {0}")]
    Store(String),
    #[error("refresh was abandoned before completing")]
    Abandoned,
}

/// Error returned by [`SessionClient`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("network failure: {0}")]
    Network(String),
    #[error("token store failed: {0}")]
    Store(#[from] StoreError),
    #[error("session expired: {0}")]
    Refresh(#[from] RefreshError),
    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// SIGN-OUT HOOK
// =============================================================================

/// Receives the one side effect of a terminal auth failure.
pub trait SessionListener: Send + Sync {
    /// Tokens have been cleared; route the user to the unauthenticated entry.
    fn on_signed_out(&self);
}

impl<F> SessionListener for F
where
    F: Fn() + Send + Sync,
{
    fn on_signed_out(&self) {
        self();
    }
}

// =============================================================================
// REQUEST
// =============================================================================

/// Body of an [`ApiRequest`].
#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    Json(serde_json::Value),
    Text(String),
}

/// Caller-side description of an API call.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API origin, e.g. `/api/couples/me`.
    pub path: String,
    /// Caller headers; each name given here replaces the default for that name.
    /// A caller `Authorization` is used for the first send only; a replay
    /// after refresh carries the renewed bearer.
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
}

impl ApiRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    #[must_use]
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    #[must_use]
    pub fn with_text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(RequestBody::Text(body.into()));
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

// =============================================================================
// CLIENT
// =============================================================================

/// Authenticated API client bound to one origin and one token store.
pub struct SessionClient {
    base_url: Url,
    backend: Arc<dyn HttpBackend>,
    store: Arc<dyn TokenStore>,
    listener: Arc<dyn SessionListener>,
    coordinator: RefreshCoordinator,
}

impl SessionClient {
    /// Build a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidUrl`] if `base_url` does not parse.
    pub fn new(
        base_url: &str,
        backend: Arc<dyn HttpBackend>,
        store: Arc<dyn TokenStore>,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Self, SessionError> {
        let base_url =
            Url::parse(base_url).map_err(|e| SessionError::InvalidUrl(format!("{base_url}: {e}")))?;
        Ok(Self {
            base_url,
            backend,
            store,
            listener,
            coordinator: RefreshCoordinator::new(),
        })
    }

    /// Build a client backed by `reqwest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn with_reqwest(
        base_url: &str,
        store: Arc<dyn TokenStore>,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Self, SessionError> {
        Self::new(base_url, Arc::new(ReqwestBackend::new()?), store, listener)
    }

    /// The token store this client reads and writes.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Refresh coordination state, for diagnostics.
    #[must_use]
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Execute `request` with the stored bearer token, refreshing once on 401.
    ///
    /// Non-2xx statuses other than 401 are returned as responses.
    ///
    /// # Errors
    ///
    /// Returns a transport error from the backend, a store error, or
    /// [`SessionError::Refresh`] when the token could not be renewed.
    pub async fn authenticated_request(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        let sent_with = self.store.get(TokenKey::Access).await?;
        let response = self.send(&request, sent_with.as_deref(), Attempt::First).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!(method = %request.method, path = %request.path, "access token rejected");
        let token = match self.coordinator.join() {
            Ticket::Leader(guard) => {
                let outcome = self.refresh_unless_renewed(sent_with.as_deref()).await;
                guard.finish(&outcome);
                outcome?
            }
            Ticket::Waiter(rx) => rx.await.map_err(|_| RefreshError::Abandoned)??,
        };

        self.send(&request, Some(&token), Attempt::Replay).await
    }

    /// [`Self::authenticated_request`], then require 2xx and decode JSON.
    ///
    /// # Errors
    ///
    /// Additionally returns [`SessionError::Status`] for non-2xx responses and
    /// [`SessionError::Json`] when the body does not decode.
    pub async fn request_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, SessionError> {
        let response = self.authenticated_request(request).await?;
        if !response.is_success() {
            return Err(SessionError::Status {
                status: response.status.as_u16(),
                body: response.text(),
            });
        }
        Ok(response.json()?)
    }

    /// Persist a token pair obtained at sign-in.
    ///
    /// # Errors
    ///
    /// Returns a store error if either key cannot be written.
    pub async fn store_session(&self, tokens: &SessionTokens) -> Result<(), SessionError> {
        self.store.set(TokenKey::Access, &tokens.access_token).await?;
        if let Some(refresh) = &tokens.refresh_token {
            self.store.set(TokenKey::Refresh, refresh).await?;
        }
        Ok(())
    }

    /// Clear the session and notify the listener.
    ///
    /// # Errors
    ///
    /// Returns a store error if the tokens cannot be removed; the listener is
    /// still notified.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let cleared = self.store.clear().await;
        self.listener.on_signed_out();
        tracing::info!("signed out");
        cleared.map_err(SessionError::from)
    }

    /// Renew the access token, skipping the network call when another
    /// refresh already replaced the token this request was sent with.
    async fn refresh_unless_renewed(&self, sent_with: Option<&str>) -> Result<String, RefreshError> {
        let current = self
            .store
            .get(TokenKey::Access)
            .await
            .map_err(|e| RefreshError::Store(e.to_string()))?;
        if let Some(current) = current {
            if sent_with.is_some_and(|sent| sent != current) {
                tracing::debug!("access token already renewed; replaying");
                return Ok(current);
            }
        }
        self.refresh().await
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Any failure clears the session and fires the sign-out hook.
    async fn refresh(&self) -> Result<String, RefreshError> {
        match self.try_refresh().await {
            Ok(token) => {
                tracing::info!("access token refreshed");
                Ok(token)
            }
            Err(error) => {
                tracing::warn!(error = %error, "token refresh failed; ending session");
                if let Err(store_error) = self.store.clear().await {
                    tracing::error!(error = %store_error, "failed to clear session tokens");
                }
                self.listener.on_signed_out();
                Err(error)
            }
        }
    }

    async fn try_refresh(&self) -> Result<String, RefreshError> {
        let refresh_token = self
            .store
            .get(TokenKey::Refresh)
            .await
            .map_err(|e| RefreshError::Store(e.to_string()))?
            .ok_or(RefreshError::MissingRefreshToken)?;

        let url = refresh_url(&self.base_url, &refresh_token)
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let request = HttpRequest {
            method: Method::POST,
            url,
            headers,
            body: None,
        };

        let response = self
            .backend
            .execute(request)
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;
        if !response.is_success() {
            return Err(RefreshError::Rejected {
                status: response.status.as_u16(),
            });
        }

        let body: RefreshResponse = response
            .json()
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RefreshError::InvalidResponse("missing accessToken".to_owned()))?;

        self.store
            .set(TokenKey::Access, &access_token)
            .await
            .map_err(|e| RefreshError::Store(e.to_string()))?;
        if let Some(refresh_token) = body.refresh_token.filter(|t| !t.is_empty()) {
            self.store
                .set(TokenKey::Refresh, &refresh_token)
                .await
                .map_err(|e| RefreshError::Store(e.to_string()))?;
        }
        Ok(access_token)
    }

    async fn send(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
        attempt: Attempt,
    ) -> Result<ApiResponse, SessionError> {
        let url = self
            .base_url
            .join(&request.path)
            .map_err(|e| SessionError::InvalidUrl(format!("{}: {e}", request.path)))?;
        let mut headers = merge_headers(default_headers(token)?, &request.headers);
        if let (Attempt::Replay, Some(token)) = (attempt, token) {
            headers.insert(AUTHORIZATION, bearer(token)?);
        }
        let body = match &request.body {
            Some(RequestBody::Json(value)) => Some(serde_json::to_vec(value)?),
            Some(RequestBody::Text(text)) => Some(text.clone().into_bytes()),
            None => None,
        };

        self.backend
            .execute(HttpRequest {
                method: request.method.clone(),
                url,
                headers,
                body,
            })
            .await
    }
}

/// `{base}/api/auth/refresh?refreshToken=<token>`, with the token URL-encoded.
///
/// # Errors
///
/// Returns the URL parse error if the refresh path cannot be joined.
pub fn refresh_url(base_url: &Url, refresh_token: &str) -> Result<Url, SessionError> {
    let mut url = base_url
        .join(REFRESH_PATH)
        .map_err(|e| SessionError::InvalidUrl(e.to_string()))?;
    url.query_pairs_mut().append_pair("refreshToken", refresh_token);
    Ok(url)
}

/// Which send of a request this is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    First,
    /// After a refresh; the renewed bearer replaces any caller `Authorization`.
    Replay,
}

fn bearer(token: &str) -> Result<HeaderValue, SessionError> {
    Ok(HeaderValue::from_str(&format!("Bearer {token}"))?)
}

fn default_headers(token: Option<&str>) -> Result<HeaderMap, SessionError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(token) = token {
        headers.insert(AUTHORIZATION, bearer(token)?);
    }
    Ok(headers)
}

/// Defaults first; a name present in `overrides` replaces all default values
/// for that name.
fn merge_headers(mut base: HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    for name in overrides.keys() {
        base.remove(name);
    }
    for (name, value) in overrides {
        base.append(name.clone(), value.clone());
    }
    base
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
