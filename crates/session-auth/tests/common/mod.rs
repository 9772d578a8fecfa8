#![allow(dead_code)]

use async_trait::async_trait;
use credential_storage::{Credential, CredentialStore, MemoryStorage, User};
use parking_lot::Mutex;
use session_auth::{
    ApiRequest, ApiResponse, AuthClient, AuthError, AuthResult, AuthSettings, HttpTransport,
    LoginGrant, RefreshError, TokenEndpoint, TokenGrant,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

pub const BASE_URL: &str = "https://api.keyward.test/v1";

pub fn test_user() -> User {
    User {
        id: "user-1".to_string(),
        email: "user-1@example.com".to_string(),
        display_name: Some("Test User".to_string()),
        photo_url: None,
    }
}

pub fn test_user_json() -> String {
    r#"{"id":"user-1","email":"user-1@example.com","display_name":"Test User"}"#.to_string()
}

/// An in-memory credential store, optionally seeded with a token pair.
pub fn store_with(tokens: Option<(&str, &str)>) -> Arc<CredentialStore> {
    let store = Arc::new(CredentialStore::new(Box::new(MemoryStorage::new())));
    if let Some((access, refresh)) = tokens {
        store
            .save(&Credential::new(access, refresh))
            .expect("failed to seed credential");
    }
    store
}

/// Short logout timeout so timeout tests stay fast.
pub fn test_settings() -> AuthSettings {
    AuthSettings {
        logout_timeout: Duration::from_millis(50),
        ..AuthSettings::default()
    }
}

/// How the fake backend answers `logout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutBehavior {
    Succeed,
    Fail,
    Hang,
}

/// Scripted token endpoint.
///
/// Refresh results are consumed in order; each call takes its result before
/// waiting on the gate, so results map to rounds by call order.
pub struct FakeEndpoint {
    gated: bool,
    gate: Semaphore,
    refresh_calls: AtomicUsize,
    refresh_returns: AtomicUsize,
    refresh_results: Mutex<VecDeque<Result<TokenGrant, RefreshError>>>,
    received_refresh_tokens: Mutex<Vec<String>>,
    login_grant: Mutex<Option<LoginGrant>>,
    logout_behavior: Mutex<LogoutBehavior>,
    logout_calls: AtomicUsize,
}

impl FakeEndpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    /// Every refresh call blocks until [`FakeEndpoint::release`].
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    fn build(gated: bool) -> Self {
        Self {
            gated,
            gate: Semaphore::new(0),
            refresh_calls: AtomicUsize::new(0),
            refresh_returns: AtomicUsize::new(0),
            refresh_results: Mutex::new(VecDeque::new()),
            received_refresh_tokens: Mutex::new(Vec::new()),
            login_grant: Mutex::new(None),
            logout_behavior: Mutex::new(LogoutBehavior::Succeed),
            logout_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_refresh(&self, result: Result<TokenGrant, RefreshError>) {
        self.refresh_results.lock().push_back(result);
    }

    pub fn set_login(&self, grant: LoginGrant) {
        *self.login_grant.lock() = Some(grant);
    }

    pub fn set_logout(&self, behavior: LogoutBehavior) {
        *self.logout_behavior.lock() = behavior;
    }

    /// Let `n` blocked refresh calls proceed.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub fn received_refresh_tokens(&self) -> Vec<String> {
        self.received_refresh_tokens.lock().clone()
    }

    /// Yield until at least `n` refresh calls have returned to the coordinator.
    ///
    /// The coordinator finishes a round in the same poll that the call
    /// returns in, so on the single-threaded test runtime the round's
    /// store writes are done once this resolves.
    pub async fn wait_for_refresh_returns(&self, n: usize) {
        while self.refresh_returns.load(Ordering::SeqCst) < n {
            tokio::task::yield_now().await;
        }
    }

    /// Yield until at least `n` refresh calls have started.
    pub async fn wait_for_refresh_calls(&self, n: usize) {
        while self.refresh_calls() < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl TokenEndpoint for FakeEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, RefreshError> {
        self.received_refresh_tokens
            .lock()
            .push(refresh_token.to_string());
        let result = self.refresh_results.lock().pop_front().unwrap_or_else(|| {
            Err(RefreshError::Rejected {
                status: 400,
                detail: "no scripted refresh result".to_string(),
            })
        });
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        if self.gated {
            self.gate
                .acquire()
                .await
                .expect("refresh gate closed")
                .forget();
        }
        self.refresh_returns.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn exchange_login(&self, _id_token: &str) -> AuthResult<LoginGrant> {
        self.login_grant
            .lock()
            .clone()
            .ok_or_else(|| AuthError::SignInFailed("HTTP 401: invalid id token".to_string()))
    }

    async fn logout(&self, _refresh_token: &str) -> AuthResult<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.logout_behavior.lock();
        match behavior {
            LogoutBehavior::Succeed => Ok(()),
            LogoutBehavior::Fail => Err(AuthError::Api {
                status: 500,
                detail: "logout failed".to_string(),
            }),
            LogoutBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// One request as the fake backend saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<serde_json::Value>,
}

/// Fake backend for gateway traffic.
///
/// Requests whose bearer differs from the accepted token get 401. Routes are
/// keyed by `"METHOD /path"`; queued responses are served in order and the
/// last one repeats. Unknown routes answer 404.
pub struct FakeBackend {
    accepted_token: Mutex<Option<String>>,
    routes: Mutex<HashMap<String, VecDeque<ApiResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    offline: AtomicBool,
    on_request: Mutex<Option<RequestHook>>,
}

/// Runs while the backend is handling a request, before it answers.
pub type RequestHook = Arc<dyn Fn(&RecordedRequest) + Send + Sync>;

impl FakeBackend {
    pub fn accepting(token: &str) -> Arc<Self> {
        Arc::new(Self {
            accepted_token: Mutex::new(Some(token.to_string())),
            routes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            on_request: Mutex::new(None),
        })
    }

    pub fn accept(&self, token: &str) {
        *self.accepted_token.lock() = Some(token.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn on_request(&self, hook: RequestHook) {
        *self.on_request.lock() = Some(hook);
    }

    pub fn route(&self, method: &str, path: &str, status: u16, body: &str) {
        self.routes
            .lock()
            .entry(format!("{} {}", method, path))
            .or_default()
            .push_back(ApiResponse::new(status, body));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }
}

#[async_trait]
impl HttpTransport for FakeBackend {
    async fn execute(
        &self,
        _url: Url,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> AuthResult<ApiResponse> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuthError::NetworkUnavailable);
        }

        let recorded = RecordedRequest {
            method: request.method.as_str().to_string(),
            path: request.path.clone(),
            bearer: bearer.map(str::to_string),
            body: request.body.clone(),
        };
        self.requests.lock().push(recorded.clone());
        let hook = self.on_request.lock().clone();
        if let Some(hook) = hook {
            hook(&recorded);
        }

        let accepted = self.accepted_token.lock().clone();
        if accepted.is_some() && accepted.as_deref() != bearer {
            return Ok(ApiResponse::new(401, r#"{"detail":"token expired"}"#));
        }

        let key = format!("{} {}", request.method.as_str(), request.path);
        let mut routes = self.routes.lock();
        let response = match routes.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(response.unwrap_or_else(|| ApiResponse::new(404, r#"{"detail":"not found"}"#)))
    }
}

pub struct Harness {
    pub client: AuthClient,
    pub store: Arc<CredentialStore>,
    pub backend: Arc<FakeBackend>,
    pub endpoint: Arc<FakeEndpoint>,
}

pub fn harness(
    store: Arc<CredentialStore>,
    backend: Arc<FakeBackend>,
    endpoint: Arc<FakeEndpoint>,
) -> Harness {
    harness_with_settings(store, backend, endpoint, test_settings())
}

pub fn harness_with_settings(
    store: Arc<CredentialStore>,
    backend: Arc<FakeBackend>,
    endpoint: Arc<FakeEndpoint>,
    settings: AuthSettings,
) -> Harness {
    let client = AuthClient::from_parts(
        Url::parse(BASE_URL).expect("invalid base url"),
        store.clone(),
        backend.clone(),
        endpoint.clone(),
        settings,
    );
    Harness {
        client,
        store,
        backend,
        endpoint,
    }
}

/// Harness with `AT1`/`RT1` stored, a backend accepting `AT1` and `/me` routed.
pub fn signed_in_harness(endpoint: Arc<FakeEndpoint>) -> Harness {
    let backend = FakeBackend::accepting("AT1");
    backend.route("GET", "/me", 200, &test_user_json());
    harness(store_with(Some(("AT1", "RT1"))), backend, endpoint)
}
