//! Authenticated request gateway.
//!
//! `AuthGateway::request` attaches the stored bearer token to a request and
//! handles 401 responses with a single shared token refresh: the first
//! rejected request refreshes, every request rejected meanwhile waits for
//! that refresh, and all of them are replayed with the new token. Waiting
//! requests replay in the order they were rejected, ahead of the request
//! that ran the refresh. When the refresh fails the credentials are cleared and the host is told the
//! session is over.

use std::fmt;
use std::future;
use std::sync::Arc;

use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::{CredentialStore, StoreError};
use crate::single_flight::{Flight, SingleFlight, Turn};

use super::request::{Body, ContentType, HttpRequest, HttpResponse, RequestOptions};
use super::transport::{Transport, TransportError};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Called once the session is known to be unrecoverable.
pub type SessionInvalidHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Credential storage failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
enum RefreshError {
    #[error("no token to refresh")]
    NoToken,

    #[error("refresh rejected with status {0}")]
    Rejected(StatusCode),

    #[error("refresh request failed: {0}")]
    Transport(#[from] TransportError),

    #[error("refresh response is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("refresh response carried no token")]
    MissingToken,

    #[error("could not store refreshed token: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOutcome {
    Refreshed,
    Failed,
}

struct GatewayInner {
    transport: Arc<dyn Transport>,
    credentials: CredentialStore,
    refresh_url: String,
    refresh: SingleFlight<RefreshOutcome>,
    on_session_invalid: SessionInvalidHandler,
}

/// Clone is cheap - clones share the credential store and refresh state.
#[derive(Clone)]
pub struct AuthGateway {
    inner: Arc<GatewayInner>,
}

impl fmt::Debug for AuthGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGateway")
            .field("refresh_url", &self.inner.refresh_url)
            .field("refresh_in_flight", &self.inner.refresh.is_in_flight())
            .finish()
    }
}

pub struct AuthGatewayBuilder {
    transport: Arc<dyn Transport>,
    credentials: CredentialStore,
    refresh_url: String,
    on_session_invalid: Option<SessionInvalidHandler>,
}

impl AuthGatewayBuilder {
    pub fn on_session_invalid<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_session_invalid = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> AuthGateway {
        let on_session_invalid = self
            .on_session_invalid
            .unwrap_or_else(|| Arc::new(|| warn!("Session invalidated with no handler installed")));
        AuthGateway {
            inner: Arc::new(GatewayInner {
                transport: self.transport,
                credentials: self.credentials,
                refresh_url: self.refresh_url,
                refresh: SingleFlight::new(),
                on_session_invalid,
            }),
        }
    }
}

impl AuthGateway {
    pub fn builder(
        transport: Arc<dyn Transport>,
        credentials: CredentialStore,
        refresh_url: impl Into<String>,
    ) -> AuthGatewayBuilder {
        AuthGatewayBuilder {
            transport,
            credentials,
            refresh_url: refresh_url.into(),
            on_session_invalid: None,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.inner.refresh.is_in_flight()
    }

    /// Requests currently waiting on the in-flight refresh
    pub fn refresh_waiters(&self) -> usize {
        self.inner.refresh.waiter_count()
    }

    /// Send a request with the current credentials, refreshing the token
    /// once if the server answers 401.
    ///
    /// Transport failures are returned as-is and never retried.
    pub async fn request(
        &self,
        target: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, GatewayError> {
        let token = self.inner.credentials.token()?;
        let response = self.send(target, &options, token.as_deref()).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        debug!(url = target, "Request unauthorized, awaiting token refresh");
        let flight = self
            .inner
            .refresh
            .run_exclusive(|| self.refresh_cycle())
            .await;

        match flight {
            Flight::Led(RefreshOutcome::Refreshed) => self.replay(target, &options, None).await,
            Flight::Joined(RefreshOutcome::Refreshed, turn) => {
                self.replay(target, &options, Some(turn)).await
            }
            // Credentials were already cleared by the cycle leader
            Flight::Led(RefreshOutcome::Failed)
            | Flight::Joined(RefreshOutcome::Failed, _)
            | Flight::Abandoned => Ok(response),
        }
    }

    /// Send a request with no credentials and no refresh handling.
    ///
    /// Used by the login flow, where a 401 means a wrong verification code
    /// rather than an expired session.
    pub async fn request_anonymous(
        &self,
        target: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, GatewayError> {
        self.send(target, &options, None).await
    }

    /// Re-issue a request after a successful refresh. A second 401 is not
    /// refreshed again; it ends the session.
    ///
    /// A waiting request passes its `turn` once its replay has reached the
    /// transport, so queued requests go out in order and before the leader's.
    async fn replay(
        &self,
        target: &str,
        options: &RequestOptions,
        mut turn: Option<Turn>,
    ) -> Result<HttpResponse, GatewayError> {
        // Read only after the cycle completed so the replay uses the new token
        let token = self.inner.credentials.token()?;
        let request = build_request(target, options, token.as_deref())?;
        debug!(url = target, "Replaying request with refreshed token");

        let mut sending = self.inner.transport.send(request);
        let response = future::poll_fn(|cx| {
            let poll = sending.as_mut().poll(cx);
            if let Some(turn) = turn.take() {
                turn.pass();
            }
            poll
        })
        .await?;

        if response.is_unauthorized() {
            warn!(url = target, "Refreshed token was rejected");
            self.terminate_if_current(token.as_deref());
        }
        Ok(response)
    }

    async fn send(
        &self,
        target: &str,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> Result<HttpResponse, GatewayError> {
        let request = build_request(target, options, token)?;
        debug!(method = %request.method, url = target, authenticated = token.is_some(), "Sending request");
        Ok(self.inner.transport.send(request).await?)
    }

    /// Body of one refresh cycle; only the cycle leader runs it.
    async fn refresh_cycle(&self) -> RefreshOutcome {
        info!("Refreshing access token");
        match self.refresh_token().await {
            Ok(()) => {
                info!("Access token refreshed");
                RefreshOutcome::Refreshed
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                self.terminate_session();
                RefreshOutcome::Failed
            }
        }
    }

    async fn refresh_token(&self) -> Result<(), RefreshError> {
        let token = self.inner.credentials.token()?.ok_or(RefreshError::NoToken)?;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        headers.insert(AUTHORIZATION, bearer_value(&token)?);
        let request = HttpRequest {
            method: Method::POST,
            url: self.inner.refresh_url.clone(),
            headers,
            body: Body::Empty,
        };

        let response = self.inner.transport.send(request).await?;
        if !response.is_success() {
            return Err(RefreshError::Rejected(response.status()));
        }

        let body: RefreshResponse = response.json()?;
        let new_token = body
            .token
            .filter(|t| !t.is_empty())
            .ok_or(RefreshError::MissingToken)?;
        self.inner.credentials.set_token(&new_token)?;
        Ok(())
    }

    /// Clear every credential field and notify the host.
    fn terminate_session(&self) {
        warn!("Terminating session");
        if let Err(e) = self.inner.credentials.clear_all() {
            warn!(error = %e, "Failed to clear credentials during session termination");
        }
        (self.inner.on_session_invalid)();
    }

    /// Terminate only if the store still holds `used`, so concurrent
    /// rejected replays end the session once per token.
    fn terminate_if_current(&self, used: Option<&str>) {
        match self.inner.credentials.token() {
            Ok(Some(current)) if Some(current.as_str()) == used => self.terminate_session(),
            Ok(_) => debug!("Credentials already replaced or cleared"),
            Err(e) => warn!(error = %e, "Could not read credentials after rejected replay"),
        }
    }
}

fn bearer_value(token: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| TransportError::InvalidRequest("token is not a valid header value".to_string()))
}

/// Apply the header rules: the gateway owns `Authorization`, and
/// `Content-Type` follows the caller's `ContentType` choice.
fn build_request(
    target: &str,
    options: &RequestOptions,
    token: Option<&str>,
) -> Result<HttpRequest, TransportError> {
    let mut headers = options.headers.clone();
    headers.remove(AUTHORIZATION);

    match &options.content_type {
        ContentType::Explicit(value) => {
            let value = HeaderValue::from_str(value).map_err(|_| {
                TransportError::InvalidRequest(format!("invalid content type: {}", value))
            })?;
            headers.insert(CONTENT_TYPE, value);
        }
        ContentType::Suppressed => {
            headers.remove(CONTENT_TYPE);
        }
        ContentType::Default => {
            if !options.body.is_multipart() && !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
            }
        }
    }

    if let Some(token) = token {
        headers.insert(AUTHORIZATION, bearer_value(token)?);
    }

    Ok(HttpRequest {
        method: options.method.clone(),
        url: target.to_string(),
        headers,
        body: options.body.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::api::request::MultipartForm;
    use crate::api::test_support::{bearer, content_type, json_response, FakeTransport};

    const REFRESH_URL: &str = "http://market.test/api/v1/auth/refresh";
    const BIDS_URL: &str = "http://market.test/api/v1/bids";

    struct Harness {
        transport: Arc<FakeTransport>,
        gateway: AuthGateway,
        invalidations: Arc<AtomicUsize>,
    }

    fn harness(transport: Arc<FakeTransport>) -> Harness {
        let credentials = CredentialStore::in_memory();
        credentials.set_token("abc").unwrap();
        credentials.set_phone("13800000000").unwrap();
        credentials.set_username("mill-buyer").unwrap();

        let invalidations = Arc::new(AtomicUsize::new(0));
        let counter = invalidations.clone();
        let gateway = AuthGateway::builder(transport.clone(), credentials, REFRESH_URL)
            .on_session_invalid(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        Harness {
            transport,
            gateway,
            invalidations,
        }
    }

    /// Server that accepts only `xyz` and rotates any token to `xyz`
    fn rotating_server() -> Arc<FakeTransport> {
        FakeTransport::new(|request| {
            if request.url == REFRESH_URL {
                return Ok(json_response(StatusCode::OK, json!({ "token": "xyz" })));
            }
            if bearer(request).as_deref() == Some("xyz") {
                Ok(json_response(StatusCode::OK, json!({ "path": request.url })))
            } else {
                Ok(json_response(StatusCode::UNAUTHORIZED, json!({ "message": "expired" })))
            }
        })
    }

    /// Server that rejects everything, including refresh
    fn rejecting_server() -> Arc<FakeTransport> {
        FakeTransport::new(|_| Ok(json_response(StatusCode::UNAUTHORIZED, json!({}))))
    }

    #[tokio::test]
    async fn test_non_401_passes_through_untouched() {
        let transport = FakeTransport::new(|_| Ok(HttpResponse::new(StatusCode::NOT_FOUND, "missing")));
        let h = harness(transport);

        let response = h.gateway.request(BIDS_URL, RequestOptions::get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.text(), "missing");
        assert_eq!(h.transport.total_calls(), 1);
        assert_eq!(bearer(&h.transport.requests()[0]).as_deref(), Some("abc"));

        let record = h.gateway.credentials().snapshot().unwrap();
        assert_eq!(record.token.as_deref(), Some("abc"));
        assert_eq!(record.phone.as_deref(), Some("13800000000"));
        assert_eq!(record.username.as_deref(), Some("mill-buyer"));
        assert_eq!(h.invalidations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_then_replay_with_new_token() {
        let h = harness(rotating_server());

        let response = h.gateway.request(BIDS_URL, RequestOptions::get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["path"], BIDS_URL);

        assert_eq!(h.gateway.credentials().token().unwrap().as_deref(), Some("xyz"));

        let refreshes = h.transport.requests_to(REFRESH_URL);
        assert_eq!(refreshes.len(), 1);
        assert_eq!(refreshes[0].method, Method::POST);
        assert_eq!(bearer(&refreshes[0]).as_deref(), Some("abc"));

        let calls = h.transport.requests_to(BIDS_URL);
        assert_eq!(calls.len(), 2);
        assert_eq!(bearer(&calls[0]).as_deref(), Some("abc"));
        assert_eq!(bearer(&calls[1]).as_deref(), Some("xyz"));
        assert_eq!(h.invalidations.load(Ordering::SeqCst), 0);
        assert!(!h.gateway.refresh_in_flight());
    }

    #[tokio::test]
    async fn test_replay_keeps_method_and_body() {
        let h = harness(rotating_server());
        let options = RequestOptions::post()
            .json(&json!({ "bountyId": 4, "bidPrice": 12.5 }))
            .unwrap();

        h.gateway.request(BIDS_URL, options).await.unwrap();

        let calls = h.transport.requests_to(BIDS_URL);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].method, calls[1].method);
        assert_eq!(calls[0].body, calls[1].body);
        assert_eq!(content_type(&calls[1]).as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_refresh_rejected_terminates_session() {
        let transport = FakeTransport::new(|request| {
            if request.url == REFRESH_URL {
                Ok(HttpResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "down"))
            } else {
                Ok(json_response(StatusCode::UNAUTHORIZED, json!({ "message": "expired" })))
            }
        });
        let h = harness(transport);

        let response = h.gateway.request(BIDS_URL, RequestOptions::get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.json::<serde_json::Value>().unwrap()["message"], "expired");

        assert_eq!(h.gateway.credentials().snapshot().unwrap(), Default::default());
        assert_eq!(h.invalidations.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.calls_to(REFRESH_URL), 1);
        assert_eq!(h.transport.calls_to(BIDS_URL), 1);
    }

    #[tokio::test]
    async fn test_refresh_without_token_field_fails() {
        let transport = FakeTransport::new(|request| {
            if request.url == REFRESH_URL {
                Ok(json_response(StatusCode::OK, json!({ "message": "ok" })))
            } else {
                Ok(HttpResponse::new(StatusCode::UNAUTHORIZED, ""))
            }
        });
        let h = harness(transport);

        let response = h.gateway.request(BIDS_URL, RequestOptions::get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!h.gateway.credentials().is_authenticated().unwrap());
        assert_eq!(h.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_with_malformed_body_fails() {
        let transport = FakeTransport::new(|request| {
            if request.url == REFRESH_URL {
                Ok(HttpResponse::new(StatusCode::OK, "<html>"))
            } else {
                Ok(HttpResponse::new(StatusCode::UNAUTHORIZED, ""))
            }
        });
        let h = harness(transport);

        let response = h.gateway.request(BIDS_URL, RequestOptions::get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(h.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_transport_error_fails() {
        let transport = FakeTransport::new(|request| {
            if request.url == REFRESH_URL {
                Err(TransportError::Timeout(request.url.clone()))
            } else {
                Ok(HttpResponse::new(StatusCode::UNAUTHORIZED, ""))
            }
        });
        let h = harness(transport);

        let response = h.gateway.request(BIDS_URL, RequestOptions::get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!h.gateway.credentials().is_authenticated().unwrap());
        assert_eq!(h.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unauthenticated_401_skips_refresh_call() {
        let h = harness(rejecting_server());
        h.gateway.credentials().clear(crate::auth::CredentialField::Token).unwrap();

        let response = h.gateway.request(BIDS_URL, RequestOptions::get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(bearer(&h.transport.requests()[0]), None);
        assert_eq!(h.transport.calls_to(REFRESH_URL), 0);
        assert_eq!(h.gateway.credentials().username().unwrap(), None);
        assert_eq!(h.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_error_propagates_without_retry() {
        let transport = FakeTransport::new(|request| Err(TransportError::Timeout(request.url.clone())));
        let h = harness(transport);

        let result = h.gateway.request(BIDS_URL, RequestOptions::get()).await;
        assert!(matches!(
            result,
            Err(GatewayError::Transport(TransportError::Timeout(_)))
        ));
        assert_eq!(h.transport.total_calls(), 1);
        assert!(h.gateway.credentials().is_authenticated().unwrap());
    }

    #[tokio::test]
    async fn test_rejected_replay_ends_session_without_second_refresh() {
        let transport = FakeTransport::new(|request| {
            if request.url == REFRESH_URL {
                Ok(json_response(StatusCode::OK, json!({ "token": "xyz" })))
            } else {
                Ok(HttpResponse::new(StatusCode::UNAUTHORIZED, ""))
            }
        });
        let h = harness(transport);

        let response = h.gateway.request(BIDS_URL, RequestOptions::get()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(h.transport.calls_to(REFRESH_URL), 1);
        assert_eq!(h.transport.calls_to(BIDS_URL), 2);
        assert!(!h.gateway.credentials().is_authenticated().unwrap());
        assert_eq!(h.invalidations.load(Ordering::SeqCst), 1);
    }

    async fn wait_for_waiters(gateway: &AuthGateway, count: usize) {
        while gateway.refresh_waiters() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let h = harness(rotating_server());
        let release = h.transport.hold(REFRESH_URL);

        let leader = {
            let gateway = h.gateway.clone();
            tokio::spawn(async move { gateway.request(BIDS_URL, RequestOptions::get()).await })
        };
        while h.transport.calls_to(REFRESH_URL) == 0 {
            tokio::task::yield_now().await;
        }

        let mut joiners = Vec::new();
        for i in 0..5 {
            let gateway = h.gateway.clone();
            let url = format!("{}/{}", BIDS_URL, i);
            joiners.push(tokio::spawn(async move {
                gateway.request(&url, RequestOptions::get()).await
            }));
        }
        wait_for_waiters(&h.gateway, 5).await;
        release.notify_one();

        assert_eq!(leader.await.unwrap().unwrap().status(), StatusCode::OK);
        let results = futures::future::join_all(joiners).await;
        for (i, result) in results.into_iter().enumerate() {
            let response = result.unwrap().unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let url = format!("{}/{}", BIDS_URL, i);
            let calls = h.transport.requests_to(&url);
            assert_eq!(calls.len(), 2);
            assert_eq!(bearer(&calls[1]).as_deref(), Some("xyz"));
        }
        assert_eq!(h.transport.calls_to(REFRESH_URL), 1);
        assert_eq!(h.invalidations.load(Ordering::SeqCst), 0);
        assert!(!h.gateway.refresh_in_flight());
        assert_eq!(h.gateway.refresh_waiters(), 0);
    }

    #[tokio::test]
    async fn test_two_simultaneous_401s_replay_their_own_requests() {
        let h = harness(rotating_server());
        let release = h.transport.hold(REFRESH_URL);
        let url_a = format!("{}/a", BIDS_URL);
        let url_b = format!("{}/b", BIDS_URL);

        let a = {
            let gateway = h.gateway.clone();
            let url = url_a.clone();
            tokio::spawn(async move {
                gateway
                    .request(&url, RequestOptions::post().json(&json!({ "who": "a" })).unwrap())
                    .await
            })
        };
        let b = {
            let gateway = h.gateway.clone();
            let url = url_b.clone();
            tokio::spawn(async move {
                gateway
                    .request(&url, RequestOptions::post().json(&json!({ "who": "b" })).unwrap())
                    .await
            })
        };

        wait_for_waiters(&h.gateway, 1).await;
        release.notify_one();

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.json::<serde_json::Value>().unwrap()["path"], url_a.as_str());
        assert_eq!(b.json::<serde_json::Value>().unwrap()["path"], url_b.as_str());

        assert_eq!(h.transport.calls_to(REFRESH_URL), 1);
        for (url, who) in [(&url_a, "a"), (&url_b, "b")] {
            let calls = h.transport.requests_to(url);
            assert_eq!(calls.len(), 2);
            let replayed: serde_json::Value = match &calls[1].body {
                Body::Json(bytes) => serde_json::from_slice(bytes).unwrap(),
                other => panic!("unexpected body {:?}", other),
            };
            assert_eq!(replayed["who"], who);
        }
    }

    #[tokio::test]
    async fn test_waiters_replay_in_order_before_leader() {
        let h = harness(rotating_server());
        let release = h.transport.hold(REFRESH_URL);
        let url_for = |name: &str| format!("{}/{}", BIDS_URL, name);

        let spawn_request = |name: &str| {
            let gateway = h.gateway.clone();
            let url = url_for(name);
            tokio::spawn(async move { gateway.request(&url, RequestOptions::get()).await })
        };

        let leader = spawn_request("leader");
        while h.transport.calls_to(REFRESH_URL) == 0 {
            tokio::task::yield_now().await;
        }
        let first = spawn_request("w1");
        wait_for_waiters(&h.gateway, 1).await;
        let second = spawn_request("w2");
        wait_for_waiters(&h.gateway, 2).await;
        release.notify_one();

        for task in [leader, first, second] {
            assert_eq!(task.await.unwrap().unwrap().status(), StatusCode::OK);
        }

        let replayed: Vec<String> = h
            .transport
            .requests()
            .into_iter()
            .filter(|r| r.url != REFRESH_URL && bearer(r).as_deref() == Some("xyz"))
            .map(|r| r.url)
            .collect();
        assert_eq!(replayed, vec![url_for("w1"), url_for("w2"), url_for("leader")]);
    }

    #[tokio::test]
    async fn test_waiters_resolve_when_refresh_fails() {
        let transport = FakeTransport::new(|request| {
            if request.url == REFRESH_URL {
                Ok(HttpResponse::new(StatusCode::FORBIDDEN, ""))
            } else {
                Ok(HttpResponse::new(StatusCode::UNAUTHORIZED, "stale"))
            }
        });
        let h = harness(transport);
        let release = h.transport.hold(REFRESH_URL);

        let mut tasks = Vec::new();
        for i in 0..4 {
            let gateway = h.gateway.clone();
            let url = format!("{}/{}", BIDS_URL, i);
            tasks.push(tokio::spawn(async move {
                gateway.request(&url, RequestOptions::get()).await
            }));
        }
        wait_for_waiters(&h.gateway, 3).await;
        release.notify_one();

        for task in tasks {
            let response = task.await.unwrap().unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(response.text(), "stale");
        }
        assert_eq!(h.transport.calls_to(REFRESH_URL), 1);
        // Only the original four requests, no replays
        assert_eq!(h.transport.total_calls(), 5);
        assert_eq!(h.invalidations.load(Ordering::SeqCst), 1);
        assert!(!h.gateway.credentials().is_authenticated().unwrap());
    }

    #[tokio::test]
    async fn test_cycle_after_completion_refreshes_again() {
        let rotations = Arc::new(AtomicUsize::new(0));
        let counter = rotations.clone();
        let transport = FakeTransport::new(move |request| {
            if request.url == REFRESH_URL {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                return Ok(json_response(StatusCode::OK, json!({ "token": format!("t{}", n) })));
            }
            // Only rotated tokens are accepted
            match bearer(request) {
                Some(token) if token.starts_with('t') => Ok(HttpResponse::new(StatusCode::OK, token)),
                _ => Ok(HttpResponse::new(StatusCode::UNAUTHORIZED, "")),
            }
        });
        let h = harness(transport);

        let first = h.gateway.request(BIDS_URL, RequestOptions::get()).await.unwrap();
        assert_eq!(first.text(), "t1");
        h.gateway.credentials().set_token("stale").unwrap();
        let second = h.gateway.request(BIDS_URL, RequestOptions::get()).await.unwrap();
        assert_eq!(second.text(), "t2");
        assert_eq!(rotations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_anonymous_request_bypasses_refresh() {
        let h = harness(rejecting_server());

        let response = h
            .gateway
            .request_anonymous(BIDS_URL, RequestOptions::post())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(bearer(&h.transport.requests()[0]), None);
        assert_eq!(h.transport.total_calls(), 1);
        assert!(h.gateway.credentials().is_authenticated().unwrap());
        assert_eq!(h.invalidations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_default_content_type_is_json() {
        let transport = FakeTransport::new(|_| Ok(HttpResponse::new(StatusCode::OK, "")));
        let h = harness(transport);

        h.gateway.request(BIDS_URL, RequestOptions::get()).await.unwrap();
        assert_eq!(
            content_type(&h.transport.requests()[0]).as_deref(),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn test_multipart_body_gets_no_content_type() {
        let transport = FakeTransport::new(|_| Ok(HttpResponse::new(StatusCode::OK, "")));
        let h = harness(transport);
        let form = MultipartForm::new().file("license", "license.png", None, vec![0x89, 0x50]);

        h.gateway
            .request(BIDS_URL, RequestOptions::post().multipart(form))
            .await
            .unwrap();
        let request = &h.transport.requests()[0];
        assert_eq!(content_type(request), None);
        assert_eq!(bearer(request).as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_suppressed_and_explicit_content_type() {
        let transport = FakeTransport::new(|_| Ok(HttpResponse::new(StatusCode::OK, "")));
        let h = harness(transport);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/csv"));
        h.gateway
            .request(BIDS_URL, RequestOptions::get().headers(headers.clone()).without_content_type())
            .await
            .unwrap();
        h.gateway
            .request(BIDS_URL, RequestOptions::post().text("a,b").content_type("text/plain"))
            .await
            .unwrap();
        h.gateway
            .request(BIDS_URL, RequestOptions::post().headers(headers))
            .await
            .unwrap();

        let requests = h.transport.requests();
        assert_eq!(content_type(&requests[0]), None);
        assert_eq!(content_type(&requests[1]).as_deref(), Some("text/plain"));
        assert_eq!(content_type(&requests[2]).as_deref(), Some("text/csv"));
    }

    #[tokio::test]
    async fn test_no_token_means_no_authorization_header() {
        let transport = FakeTransport::new(|_| Ok(HttpResponse::new(StatusCode::OK, "")));
        let h = harness(transport);
        h.gateway.credentials().clear_all().unwrap();

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer forged"));
        h.gateway
            .request(BIDS_URL, RequestOptions::get().headers(headers))
            .await
            .unwrap();
        assert_eq!(bearer(&h.transport.requests()[0]), None);
    }
}
