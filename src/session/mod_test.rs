use super::*;

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

// =============================================================================
// ScriptedBackend
// =============================================================================

#[derive(Clone)]
enum RefreshReply {
    Issue {
        access: &'static str,
        refresh: Option<&'static str>,
    },
    Status(u16),
    NetworkDown,
    Garbage,
}

/// Accepts exactly one bearer token; everything else gets 401.
struct ScriptedBackend {
    valid_token: Mutex<String>,
    refresh_reply: RefreshReply,
    accept_refreshed: bool,
    gate: Option<Arc<Notify>>,
    race_store: Option<Arc<MemoryTokenStore>>,
    refresh_calls: AtomicUsize,
    refresh_urls: Mutex<Vec<Url>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedBackend {
    fn new(valid_token: &str, refresh_reply: RefreshReply) -> Self {
        Self {
            valid_token: Mutex::new(valid_token.to_owned()),
            refresh_reply,
            accept_refreshed: true,
            gate: None,
            race_store: None,
            refresh_calls: AtomicUsize::new(0),
            refresh_urls: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn auth_headers(&self) -> Vec<Option<String>> {
        self.requests
            .lock()
            .expect("lock")
            .iter()
            .map(|r| {
                r.headers
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(ToOwned::to_owned)
            })
            .collect()
    }

    fn refresh_response(&self) -> Result<ApiResponse, SessionError> {
        match &self.refresh_reply {
            RefreshReply::Issue { access, refresh } => {
                if self.accept_refreshed {
                    *self.valid_token.lock().expect("lock") = (*access).to_owned();
                }
                let body = serde_json::json!({ "accessToken": access, "refreshToken": refresh });
                Ok(ApiResponse::new(StatusCode::OK, body.to_string()))
            }
            RefreshReply::Status(code) => Ok(ApiResponse::new(
                StatusCode::from_u16(*code).expect("status"),
                "denied",
            )),
            RefreshReply::NetworkDown => Err(SessionError::Network("connection refused".to_owned())),
            RefreshReply::Garbage => Ok(ApiResponse::new(StatusCode::OK, "<html>")),
        }
    }
}

#[async_trait::async_trait]
impl HttpBackend for ScriptedBackend {
    async fn execute(&self, request: HttpRequest) -> Result<ApiResponse, SessionError> {
        if request.url.path() == REFRESH_PATH {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.refresh_urls.lock().expect("lock").push(request.url.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            return self.refresh_response();
        }

        self.requests.lock().expect("lock").push(request.clone());
        let presented = request
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);

        // Simulates another caller's refresh landing while this request was in flight.
        if request.url.path() == "/api/race" && presented.as_deref() == Some("Bearer T1") {
            if let Some(store) = &self.race_store {
                store.set(TokenKey::Access, "T2").await.expect("set");
            }
            *self.valid_token.lock().expect("lock") = "T2".to_owned();
            return Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, ""));
        }

        let expected = format!("Bearer {}", self.valid_token.lock().expect("lock"));
        if presented.as_deref() != Some(expected.as_str()) {
            return Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, ""));
        }
        if request.url.path() == "/api/missing" {
            return Ok(ApiResponse::new(StatusCode::NOT_FOUND, "nope"));
        }
        let body = serde_json::json!({ "path": request.url.path(), "auth": presented });
        Ok(ApiResponse::new(StatusCode::OK, body.to_string()))
    }
}

struct Harness {
    client: Arc<SessionClient>,
    backend: Arc<ScriptedBackend>,
    store: Arc<MemoryTokenStore>,
    signed_out: Arc<AtomicUsize>,
}

fn harness(backend: ScriptedBackend, access: Option<&str>, refresh: Option<&str>) -> Harness {
    let store = Arc::new(MemoryTokenStore::with_tokens(access, refresh));
    harness_with_store(backend, store)
}

fn harness_with_store(backend: ScriptedBackend, store: Arc<MemoryTokenStore>) -> Harness {
    let backend = Arc::new(backend);
    let signed_out = Arc::new(AtomicUsize::new(0));
    let counter = signed_out.clone();
    let listener = move || {
        counter.fetch_add(1, Ordering::SeqCst);
    };
    let client = SessionClient::new(
        "http://api.test",
        backend.clone(),
        store.clone(),
        Arc::new(listener),
    )
    .expect("client");
    Harness {
        client: Arc::new(client),
        backend,
        store,
        signed_out,
    }
}

const ISSUE_T2: RefreshReply = RefreshReply::Issue {
    access: "T2",
    refresh: None,
};

// =============================================================================
// request building
// =============================================================================

#[tokio::test]
async fn attaches_bearer_and_json_content_type() {
    let h = harness(ScriptedBackend::new("T1", ISSUE_T2), Some("T1"), Some("R1"));

    let response = h
        .client
        .authenticated_request(ApiRequest::get("/api/photos"))
        .await
        .expect("request");

    assert_eq!(response.status, StatusCode::OK);
    let sent = h.backend.requests.lock().expect("lock")[0].clone();
    assert_eq!(sent.url.as_str(), "http://api.test/api/photos");
    assert_eq!(sent.headers.get(AUTHORIZATION).expect("auth"), "Bearer T1");
    assert_eq!(sent.headers.get(CONTENT_TYPE).expect("ct"), "application/json");
    assert_eq!(h.backend.refresh_calls(), 0);
}

#[tokio::test]
async fn caller_header_replaces_only_that_default() {
    let h = harness(ScriptedBackend::new("T1", ISSUE_T2), Some("T1"), Some("R1"));
    let request = ApiRequest::post("/api/notes")
        .with_text("plain words")
        .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

    h.client.authenticated_request(request).await.expect("request");

    let sent = h.backend.requests.lock().expect("lock")[0].clone();
    assert_eq!(sent.headers.get(CONTENT_TYPE).expect("ct"), "text/plain");
    assert_eq!(sent.headers.get(AUTHORIZATION).expect("auth"), "Bearer T1");
    assert_eq!(sent.body.as_deref(), Some("plain words".as_bytes()));
}

#[tokio::test]
async fn json_body_is_serialized() {
    let h = harness(ScriptedBackend::new("T1", ISSUE_T2), Some("T1"), Some("R1"));
    let request = ApiRequest::put("/api/profile").with_json(serde_json::json!({ "nickname": "bee" }));

    h.client.authenticated_request(request).await.expect("request");

    let sent = h.backend.requests.lock().expect("lock")[0].clone();
    let body: serde_json::Value = serde_json::from_slice(&sent.body.expect("body")).expect("json");
    assert_eq!(body, serde_json::json!({ "nickname": "bee" }));
}

#[tokio::test]
async fn non_401_errors_pass_through_untouched() {
    let h = harness(ScriptedBackend::new("T1", ISSUE_T2), Some("T1"), Some("R1"));

    let response = h
        .client
        .authenticated_request(ApiRequest::get("/api/missing"))
        .await
        .expect("request");

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.text(), "nope");
    assert_eq!(h.backend.refresh_calls(), 0);
}

#[test]
fn refresh_url_carries_token_as_query_parameter() {
    let base = Url::parse("https://api.test").expect("url");
    let url = refresh_url(&base, "a b&c").expect("refresh url");
    assert_eq!(url.path(), "/api/auth/refresh");
    assert_eq!(url.query(), Some("refreshToken=a+b%26c"));
}

#[test]
fn merge_headers_keeps_defaults_not_overridden() {
    let defaults = default_headers(Some("T1")).expect("headers");
    let mut overrides = HeaderMap::new();
    overrides.insert("x-trace", HeaderValue::from_static("abc"));

    let merged = merge_headers(defaults, &overrides);
    assert_eq!(merged.get(AUTHORIZATION).expect("auth"), "Bearer T1");
    assert_eq!(merged.get("x-trace").expect("trace"), "abc");
}

#[test]
fn default_headers_omit_authorization_without_token() {
    let headers = default_headers(None).expect("headers");
    assert!(headers.get(AUTHORIZATION).is_none());
}

// =============================================================================
// refresh and replay
// =============================================================================

#[tokio::test]
async fn expired_token_refreshes_and_replays_with_new_token() {
    let h = harness(ScriptedBackend::new("", ISSUE_T2), Some("T1"), Some("R1"));

    let response = h
        .client
        .authenticated_request(ApiRequest::get("/api/album"))
        .await
        .expect("request");

    assert_eq!(response.status, StatusCode::OK);
    let body: serde_json::Value = response.json().expect("json");
    assert_eq!(body["auth"], "Bearer T2");
    assert_eq!(
        h.backend.auth_headers(),
        vec![Some("Bearer T1".to_owned()), Some("Bearer T2".to_owned())]
    );
    assert_eq!(h.backend.refresh_calls(), 1);
    assert_eq!(
        h.backend.refresh_urls.lock().expect("lock")[0].query(),
        Some("refreshToken=R1")
    );
    assert_eq!(h.store.get(TokenKey::Access).await.expect("get").as_deref(), Some("T2"));
    assert_eq!(h.store.get(TokenKey::Refresh).await.expect("get").as_deref(), Some("R1"));
    assert_eq!(h.signed_out.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn replay_uses_renewed_bearer_over_caller_authorization() {
    let h = harness(ScriptedBackend::new("", ISSUE_T2), Some("T1"), Some("R1"));
    let request = ApiRequest::get("/api/album")
        .with_header(AUTHORIZATION, HeaderValue::from_static("Bearer stale"));

    let response = h.client.authenticated_request(request).await.expect("request");

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        h.backend.auth_headers(),
        vec![Some("Bearer stale".to_owned()), Some("Bearer T2".to_owned())]
    );
    assert_eq!(h.backend.refresh_calls(), 1);
}

#[tokio::test]
async fn rotated_refresh_token_is_persisted() {
    let reply = RefreshReply::Issue {
        access: "T2",
        refresh: Some("R2"),
    };
    let h = harness(ScriptedBackend::new("", reply), Some("T1"), Some("R1"));

    h.client
        .authenticated_request(ApiRequest::get("/api/album"))
        .await
        .expect("request");

    assert_eq!(h.store.get(TokenKey::Refresh).await.expect("get").as_deref(), Some("R2"));
}

#[tokio::test]
async fn replay_that_still_fails_is_returned_without_second_refresh() {
    let mut backend = ScriptedBackend::new("", ISSUE_T2);
    backend.accept_refreshed = false;
    let h = harness(backend, Some("T1"), Some("R1"));

    let response = h
        .client
        .authenticated_request(ApiRequest::get("/api/album"))
        .await
        .expect("request");

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.backend.refresh_calls(), 1);
}

#[tokio::test]
async fn missing_refresh_token_signs_out_without_network_call() {
    let h = harness(ScriptedBackend::new("", ISSUE_T2), Some("T1"), None);

    let err = h
        .client
        .authenticated_request(ApiRequest::get("/api/album"))
        .await
        .expect_err("should fail");

    assert!(matches!(err, SessionError::Refresh(RefreshError::MissingRefreshToken)));
    assert_eq!(h.backend.refresh_calls(), 0);
    assert_eq!(h.store.get(TokenKey::Access).await.expect("get"), None);
    assert_eq!(h.signed_out.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_refresh_clears_session() {
    let h = harness(
        ScriptedBackend::new("", RefreshReply::Status(403)),
        Some("T1"),
        Some("R1"),
    );

    let err = h
        .client
        .authenticated_request(ApiRequest::get("/api/album"))
        .await
        .expect_err("should fail");

    assert!(matches!(
        err,
        SessionError::Refresh(RefreshError::Rejected { status: 403 })
    ));
    assert_eq!(h.store.get(TokenKey::Access).await.expect("get"), None);
    assert_eq!(h.store.get(TokenKey::Refresh).await.expect("get"), None);
    assert_eq!(h.signed_out.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn network_failure_during_refresh_is_terminal() {
    let h = harness(
        ScriptedBackend::new("", RefreshReply::NetworkDown),
        Some("T1"),
        Some("R1"),
    );

    let err = h
        .client
        .authenticated_request(ApiRequest::get("/api/album"))
        .await
        .expect_err("should fail");

    assert!(matches!(err, SessionError::Refresh(RefreshError::Network(_))));
    assert_eq!(h.signed_out.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn undecodable_refresh_body_is_terminal() {
    let h = harness(ScriptedBackend::new("", RefreshReply::Garbage), Some("T1"), Some("R1"));

    let err = h
        .client
        .authenticated_request(ApiRequest::get("/api/album"))
        .await
        .expect_err("should fail");

    assert!(matches!(err, SessionError::Refresh(RefreshError::InvalidResponse(_))));
    assert_eq!(h.store.get(TokenKey::Refresh).await.expect("get"), None);
}

#[tokio::test]
async fn renewed_token_is_reused_instead_of_refreshing_again() {
    let store = Arc::new(MemoryTokenStore::with_tokens(Some("T1"), Some("R1")));
    let mut backend = ScriptedBackend::new("T1", ISSUE_T2);
    backend.race_store = Some(store.clone());
    let h = harness_with_store(backend, store);

    let response = h
        .client
        .authenticated_request(ApiRequest::get("/api/race"))
        .await
        .expect("request");

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(h.backend.refresh_calls(), 0);
    assert_eq!(
        h.backend.auth_headers(),
        vec![Some("Bearer T1".to_owned()), Some("Bearer T2".to_owned())]
    );
}

// =============================================================================
// single-flight
// =============================================================================

async fn spawn_concurrent(h: &Harness, gate: &Notify, callers: usize) -> Vec<Result<ApiResponse, SessionError>> {
    let mut tasks = Vec::new();
    for index in 0..callers {
        let client = h.client.clone();
        tasks.push(tokio::spawn(async move {
            client
                .authenticated_request(ApiRequest::get(format!("/api/item/{index}")))
                .await
        }));
    }

    while h.client.coordinator().queued() < callers - 1 {
        tokio::task::yield_now().await;
    }
    gate.notify_one();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.expect("join"));
    }
    results
}

#[tokio::test]
async fn concurrent_401s_share_one_refresh() {
    let gate = Arc::new(Notify::new());
    let mut backend = ScriptedBackend::new("", ISSUE_T2);
    backend.gate = Some(gate.clone());
    let h = harness(backend, Some("T1"), Some("R1"));

    let results = spawn_concurrent(&h, &gate, 5).await;

    assert_eq!(h.backend.refresh_calls(), 1);
    for result in results {
        let response = result.expect("request");
        let body: serde_json::Value = response.json().expect("json");
        assert_eq!(body["auth"], "Bearer T2");
    }
    assert!(!h.client.coordinator().is_refreshing());
}

#[tokio::test]
async fn concurrent_401s_all_fail_when_refresh_fails() {
    let gate = Arc::new(Notify::new());
    let mut backend = ScriptedBackend::new("", RefreshReply::Status(401));
    backend.gate = Some(gate.clone());
    let h = harness(backend, Some("T1"), Some("R1"));

    let results = spawn_concurrent(&h, &gate, 5).await;

    assert_eq!(h.backend.refresh_calls(), 1);
    assert_eq!(h.signed_out.load(Ordering::SeqCst), 1);
    for result in results {
        assert!(matches!(
            result,
            Err(SessionError::Refresh(RefreshError::Rejected { status: 401 }))
        ));
    }
}

// =============================================================================
// convenience operations
// =============================================================================

#[tokio::test]
async fn request_json_reports_error_status() {
    let h = harness(ScriptedBackend::new("T1", ISSUE_T2), Some("T1"), Some("R1"));

    let err = h
        .client
        .request_json::<serde_json::Value>(ApiRequest::get("/api/missing"))
        .await
        .expect_err("should fail");

    assert!(matches!(err, SessionError::Status { status: 404, .. }));
}

#[tokio::test]
async fn request_json_decodes_success_body() {
    let h = harness(ScriptedBackend::new("T1", ISSUE_T2), Some("T1"), Some("R1"));

    let body: serde_json::Value = h
        .client
        .request_json(ApiRequest::get("/api/photos"))
        .await
        .expect("request");

    assert_eq!(body["path"], "/api/photos");
}

#[tokio::test]
async fn store_session_and_sign_out() {
    let h = harness(ScriptedBackend::new("T1", ISSUE_T2), None, None);
    let tokens = SessionTokens {
        access_token: "A".to_owned(),
        refresh_token: Some("R".to_owned()),
    };

    h.client.store_session(&tokens).await.expect("store");
    assert_eq!(h.store.get(TokenKey::Access).await.expect("get").as_deref(), Some("A"));

    h.client.sign_out().await.expect("sign out");
    assert_eq!(h.store.get(TokenKey::Refresh).await.expect("get"), None);
    assert_eq!(h.signed_out.load(Ordering::SeqCst), 1);
}

#[test]
fn json_or_text_falls_back_to_string() {
    assert_eq!(
        ApiResponse::new(StatusCode::OK, "plain").json_or_text(),
        serde_json::Value::String("plain".to_owned())
    );
    assert_eq!(
        ApiResponse::new(StatusCode::OK, r#"{"a":1}"#).json_or_text(),
        serde_json::json!({ "a": 1 })
    );
    assert_eq!(ApiResponse::new(StatusCode::NO_CONTENT, "").json_or_text(), serde_json::Value::Null);
}
