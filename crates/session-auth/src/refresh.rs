//! Single-flight token refresh.
//!
//! At most one refresh call is in flight per coordinator. The first caller
//! opens a round and spawns the task that performs the network call; every
//! caller, the first included, waits on a oneshot that the round resolves
//! with one shared outcome.
//!
//! ```text
//!  caller A ──┐                    ┌──► A: Ok("AT2")
//!  caller B ──┼── round #7 ── POST /refresh ──┼──► B: Ok("AT2")
//!  caller C ──┘                    └──► C: Ok("AT2")
//! ```
//!
//! `force_refresh` detaches the waiters of the current round with
//! [`RefreshError::Cancelled`] and opens a new round immediately. The
//! superseded task still runs to completion, but its result is dropped
//! without touching the store.
//!
//! [`RefreshCoordinator::cancel_round_with`] does the same without opening
//! a new round. Sign-in and sign-out run their store writes inside it, so a
//! round that belongs to the previous session can neither restore a cleared
//! pair nor wipe a freshly saved one.

use crate::token_endpoint::TokenEndpoint;
use crate::{AuthError, AuthResult, RefreshError};
use chrono::Utc;
use credential_storage::CredentialStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Shared result of one refresh round: the new access token or the round's error.
pub type RefreshOutcome = Result<String, RefreshError>;

/// Observer invoked once per completed round.
pub type RefreshListener = Arc<dyn Fn(&RefreshOutcome) + Send + Sync>;

struct Round {
    id: u64,
    waiters: Vec<oneshot::Sender<RefreshOutcome>>,
}

#[derive(Default)]
struct RefreshState {
    next_round: u64,
    current: Option<Round>,
    last_error: Option<RefreshError>,
}

struct Inner {
    store: Arc<CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    state: Mutex<RefreshState>,
    listener: Mutex<Option<RefreshListener>>,
}

/// Coordinates token refreshes so concurrent callers share one network call.
///
/// Cheap to clone; clones share the same in-flight state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<CredentialStore>, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                endpoint,
                state: Mutex::new(RefreshState::default()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Register the observer notified when a round completes.
    ///
    /// Superseded rounds are never reported.
    pub fn set_listener(&self, listener: RefreshListener) {
        *self.inner.listener.lock() = Some(listener);
    }

    /// Refresh the access token, joining the in-flight round if there is one.
    ///
    /// Returns the new access token. Every caller of the same round gets the
    /// same token or the same error.
    pub async fn refresh_if_needed(&self) -> AuthResult<String> {
        let receiver = self.join(false);
        await_outcome(receiver).await
    }

    /// Detach current waiters with `RefreshCancelled` and start a fresh round.
    pub async fn force_refresh(&self) -> AuthResult<String> {
        let receiver = self.join(true);
        await_outcome(receiver).await
    }

    /// Cancel the in-flight round and run `f` before any round can start or finish.
    ///
    /// Waiters of the cancelled round get `RefreshCancelled`; its listener
    /// notification and store writes are dropped.
    pub fn cancel_round_with<T>(&self, f: impl FnOnce() -> T) -> T {
        let mut state = self.inner.state.lock();
        if let Some(round) = state.current.take() {
            info!(
                round = round.id,
                waiters = round.waiters.len(),
                "Cancelling in-flight refresh round"
            );
            detach(round);
        }
        f()
    }

    /// True while a round is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.inner.state.lock().current.is_some()
    }

    /// Number of callers waiting on the in-flight round.
    pub fn waiter_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .current
            .as_ref()
            .map(|round| round.waiters.len())
            .unwrap_or(0)
    }

    /// Error of the most recent completed round, cleared when a new round starts.
    pub fn last_error(&self) -> Option<RefreshError> {
        self.inner.state.lock().last_error.clone()
    }

    fn join(&self, force: bool) -> oneshot::Receiver<RefreshOutcome> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.inner.state.lock();

        if force {
            if let Some(round) = state.current.take() {
                info!(
                    round = round.id,
                    waiters = round.waiters.len(),
                    "Forcing refresh, detaching waiters from in-flight round"
                );
                detach(round);
            }
        }

        if let Some(round) = state.current.as_mut() {
            round.waiters.push(sender);
            debug!(
                round = round.id,
                waiters = round.waiters.len(),
                "Joining in-flight refresh"
            );
            return receiver;
        }

        state.next_round += 1;
        let id = state.next_round;
        state.current = Some(Round {
            id,
            waiters: vec![sender],
        });
        state.last_error = None;
        drop(state);

        debug!(round = id, "Starting refresh round");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_round(id).await });

        receiver
    }
}

fn detach(round: Round) {
    for waiter in round.waiters {
        let _ = waiter.send(Err(RefreshError::Cancelled));
    }
}

async fn await_outcome(receiver: oneshot::Receiver<RefreshOutcome>) -> AuthResult<String> {
    match receiver.await {
        Ok(outcome) => outcome.map_err(AuthError::from),
        // Round task vanished without resolving its waiters.
        Err(_) => Err(AuthError::RefreshCancelled),
    }
}

impl Inner {
    /// A failed write rolls the pair back; with nothing left to refresh
    /// with, the round ends the session instead of reporting a retryable error.
    fn storage_failure(&self, id: u64, detail: String) -> RefreshError {
        match self.store.has_credential() {
            Ok(true) => RefreshError::Storage(detail),
            Ok(false) => {
                warn!(round = id, error = %detail, "Credential lost while saving refreshed tokens");
                RefreshError::NoRefreshToken
            }
            Err(e) => {
                warn!(round = id, error = %e, "Credential unreadable after failed save");
                RefreshError::Storage(detail)
            }
        }
    }

    async fn run_round(&self, id: u64) {
        let result = match self.store.get_refresh() {
            Ok(Some(refresh_token)) => self.endpoint.refresh(&refresh_token).await,
            Ok(None) => Err(RefreshError::NoRefreshToken),
            Err(e) => Err(RefreshError::Storage(e.to_string())),
        };

        let mut state = self.state.lock();
        if state.current.as_ref().map(|round| round.id) != Some(id) {
            debug!(round = id, "Refresh round superseded, discarding result");
            return;
        }

        let outcome = match result {
            Ok(grant) => self
                .store
                .update_after_refresh(
                    &grant.access_token,
                    grant.refresh_token.as_deref(),
                    grant.expires_at(Utc::now()),
                )
                .map(|credential| credential.access_token)
                .map_err(|e| self.storage_failure(id, e.to_string())),
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(_) => info!(round = id, "Token refreshed"),
            Err(e) if e.is_terminal() => {
                warn!(round = id, error = %e, "Refresh failed, clearing credentials");
                if let Err(clear_error) = self.store.clear() {
                    warn!(error = %clear_error, "Failed to clear credentials after refresh failure");
                }
            }
            Err(e) => warn!(round = id, error = %e, "Refresh failed, keeping credentials"),
        }

        if let Err(e) = &outcome {
            state.last_error = Some(e.clone());
        }
        let waiters = state
            .current
            .take()
            .map(|round| round.waiters)
            .unwrap_or_default();
        drop(state);

        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(&outcome);
        }

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_endpoint::{LoginGrant, TokenGrant};
    use async_trait::async_trait;
    use credential_storage::{
        Credential, MemoryStorage, SecureStorage, StorageError, StorageKeys, StorageResult,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Endpoint that blocks every refresh until released.
    struct GatedEndpoint {
        calls: AtomicUsize,
        gate: Notify,
        result: Result<TokenGrant, RefreshError>,
    }

    impl GatedEndpoint {
        fn new(result: Result<TokenGrant, RefreshError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                result,
            })
        }
    }

    #[async_trait]
    impl TokenEndpoint for GatedEndpoint {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            self.result.clone()
        }

        async fn exchange_login(&self, _id_token: &str) -> AuthResult<LoginGrant> {
            Err(AuthError::SignInFailed("unused".to_string()))
        }

        async fn logout(&self, _refresh_token: &str) -> AuthResult<()> {
            Ok(())
        }
    }

    /// Memory backend whose access-token writes fail once `locked` is set.
    struct LockingStorage {
        inner: MemoryStorage,
        locked: Arc<AtomicBool>,
    }

    impl SecureStorage for LockingStorage {
        fn set(&self, key: &str, value: &str) -> StorageResult<()> {
            if key == StorageKeys::ACCESS_TOKEN && self.locked.load(Ordering::SeqCst) {
                return Err(StorageError::Platform("keychain locked".to_string()));
            }
            self.inner.set(key, value)
        }

        fn get(&self, key: &str) -> StorageResult<Option<String>> {
            self.inner.get(key)
        }

        fn delete(&self, key: &str) -> StorageResult<bool> {
            self.inner.delete(key)
        }
    }

    fn store_with(credential: Option<Credential>) -> Arc<CredentialStore> {
        let store = Arc::new(CredentialStore::new(Box::new(MemoryStorage::new())));
        if let Some(credential) = credential {
            store.save(&credential).unwrap();
        }
        store
    }

    async fn wait_for_waiters(coordinator: &RefreshCoordinator, count: usize) {
        while coordinator.waiter_count() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_call() {
        let store = store_with(Some(Credential::new("AT1", "RT1")));
        let endpoint = GatedEndpoint::new(Ok(TokenGrant::new("AT2")));
        let coordinator = RefreshCoordinator::new(store.clone(), endpoint.clone());

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh_if_needed().await }
        });
        let second = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh_if_needed().await }
        });

        wait_for_waiters(&coordinator, 2).await;
        assert!(coordinator.is_refreshing());
        endpoint.gate.notify_one();

        assert_eq!(first.await.unwrap().unwrap(), "AT2");
        assert_eq!(second.await.unwrap().unwrap(), "AT2");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_refreshing());

        let credential = store.credential().unwrap().unwrap();
        assert_eq!(credential.access_token, "AT2");
        assert_eq!(credential.refresh_token, "RT1");
    }

    #[tokio::test]
    async fn test_missing_refresh_token_is_terminal() {
        let store = store_with(None);
        let endpoint = GatedEndpoint::new(Ok(TokenGrant::new("unused")));
        let coordinator = RefreshCoordinator::new(store, endpoint.clone());

        let error = coordinator.refresh_if_needed().await.unwrap_err();
        assert!(matches!(error, AuthError::NoRefreshToken));
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.last_error(), Some(RefreshError::NoRefreshToken));
    }

    #[tokio::test]
    async fn test_rejection_clears_store() {
        let store = store_with(Some(Credential::new("AT1", "RT1")));
        let endpoint = GatedEndpoint::new(Err(RefreshError::Rejected {
            status: 400,
            detail: "invalid_grant".to_string(),
        }));
        let coordinator = RefreshCoordinator::new(store.clone(), endpoint.clone());

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh_if_needed().await }
        });
        wait_for_waiters(&coordinator, 1).await;
        endpoint.gate.notify_one();

        let error = pending.await.unwrap().unwrap_err();
        assert!(matches!(error, AuthError::RefreshFailed(_)));
        assert!(!store.has_credential().unwrap());
    }

    #[tokio::test]
    async fn test_network_failure_keeps_store() {
        let store = store_with(Some(Credential::new("AT1", "RT1")));
        let endpoint = GatedEndpoint::new(Err(RefreshError::Network("offline".to_string())));
        let coordinator = RefreshCoordinator::new(store.clone(), endpoint.clone());

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh_if_needed().await }
        });
        wait_for_waiters(&coordinator, 1).await;
        endpoint.gate.notify_one();

        assert!(matches!(
            pending.await.unwrap(),
            Err(AuthError::NetworkUnavailable)
        ));
        assert_eq!(store.get_access().unwrap(), Some("AT1".to_string()));
    }

    #[tokio::test]
    async fn test_listener_fires_once_per_round() {
        let store = store_with(Some(Credential::new("AT1", "RT1")));
        let endpoint = GatedEndpoint::new(Err(RefreshError::Rejected {
            status: 401,
            detail: "revoked".to_string(),
        }));
        let coordinator = RefreshCoordinator::new(store, endpoint.clone());

        let notified = Arc::new(AtomicUsize::new(0));
        coordinator.set_listener({
            let notified = notified.clone();
            Arc::new(move |outcome: &RefreshOutcome| {
                assert!(outcome.is_err());
                notified.fetch_add(1, Ordering::SeqCst);
            })
        });

        let callers: Vec<_> = (0..5)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.refresh_if_needed().await })
            })
            .collect();
        wait_for_waiters(&coordinator, 5).await;
        endpoint.gate.notify_one();

        for caller in callers {
            assert!(caller.await.unwrap().is_err());
        }
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_stall_round() {
        let store = store_with(Some(Credential::new("AT1", "RT1")));
        let endpoint = GatedEndpoint::new(Ok(TokenGrant::new("AT2")));
        let coordinator = RefreshCoordinator::new(store.clone(), endpoint.clone());

        let abandoned = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh_if_needed().await }
        });
        wait_for_waiters(&coordinator, 1).await;
        abandoned.abort();
        endpoint.gate.notify_one();

        while coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.get_access().unwrap(), Some("AT2".to_string()));
    }

    #[tokio::test]
    async fn test_lost_pair_after_failed_save_is_terminal() {
        let locked = Arc::new(AtomicBool::new(false));
        let store = Arc::new(CredentialStore::new(Box::new(LockingStorage {
            inner: MemoryStorage::new(),
            locked: locked.clone(),
        })));
        store.save(&Credential::new("AT1", "RT1")).unwrap();
        locked.store(true, Ordering::SeqCst);

        let endpoint = GatedEndpoint::new(Ok(TokenGrant::new("AT2").with_refresh_token("RT2")));
        let coordinator = RefreshCoordinator::new(store.clone(), endpoint.clone());
        let outcomes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        coordinator.set_listener({
            let outcomes = outcomes.clone();
            Arc::new(move |outcome: &RefreshOutcome| outcomes.lock().push(outcome.clone()))
        });

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh_if_needed().await }
        });
        wait_for_waiters(&coordinator, 1).await;
        endpoint.gate.notify_one();

        let error = pending.await.unwrap().unwrap_err();
        assert!(matches!(error, AuthError::NoRefreshToken));
        assert!(!store.has_credential().unwrap());
        let expected: Vec<RefreshOutcome> = vec![Err(RefreshError::NoRefreshToken)];
        assert_eq!(*outcomes.lock(), expected);
    }

    #[tokio::test]
    async fn test_failed_save_with_pair_intact_is_transient() {
        let store = store_with(Some(Credential::new("AT1", "RT1")));
        let endpoint = GatedEndpoint::new(Ok(TokenGrant::new("")));
        let coordinator = RefreshCoordinator::new(store.clone(), endpoint.clone());

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh_if_needed().await }
        });
        wait_for_waiters(&coordinator, 1).await;
        endpoint.gate.notify_one();

        // An empty access token is rejected before anything is written.
        assert!(pending.await.unwrap().is_err());
        assert!(matches!(coordinator.last_error(), Some(RefreshError::Storage(_))));
        assert_eq!(store.get_access().unwrap(), Some("AT1".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_round_leaves_store_alone() {
        let store = store_with(Some(Credential::new("AT1", "RT1")));
        let endpoint = GatedEndpoint::new(Ok(TokenGrant::new("AT2").with_refresh_token("RT2")));
        let coordinator = RefreshCoordinator::new(store.clone(), endpoint.clone());
        let notified = Arc::new(AtomicUsize::new(0));
        coordinator.set_listener({
            let notified = notified.clone();
            Arc::new(move |_: &RefreshOutcome| {
                notified.fetch_add(1, Ordering::SeqCst);
            })
        });

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh_if_needed().await }
        });
        wait_for_waiters(&coordinator, 1).await;

        coordinator.cancel_round_with(|| store.clear()).unwrap();
        assert!(matches!(
            pending.await.unwrap(),
            Err(AuthError::RefreshCancelled)
        ));
        assert!(!coordinator.is_refreshing());

        endpoint.gate.notify_one();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(!store.has_credential().unwrap());
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }
}
