mod common;

use common::*;
use session_auth::{ApiRequest, AuthError, RefreshError, SessionState, SessionStateChanged, TokenGrant};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn test_two_callers_share_one_refresh() {
    let endpoint = FakeEndpoint::gated();
    endpoint.push_refresh(Ok(TokenGrant::new("AT2")));
    let h = signed_in_harness(endpoint);

    let first = tokio::spawn({
        let client = h.client.clone();
        async move { client.coordinator().refresh_if_needed().await }
    });
    let second = tokio::spawn({
        let client = h.client.clone();
        async move { client.coordinator().refresh_if_needed().await }
    });

    while h.client.coordinator().waiter_count() < 2 {
        tokio::task::yield_now().await;
    }
    h.endpoint.release(1);

    assert_eq!(first.await.unwrap().unwrap(), "AT2");
    assert_eq!(second.await.unwrap().unwrap(), "AT2");
    assert_eq!(h.endpoint.refresh_calls(), 1);

    let credential = h.store.credential().unwrap().unwrap();
    assert_eq!(credential.access_token, "AT2");
    assert_eq!(credential.refresh_token, "RT1");
}

#[tokio::test]
async fn test_concurrent_401s_trigger_exactly_one_refresh() {
    let endpoint = FakeEndpoint::new();
    endpoint.push_refresh(Ok(TokenGrant::new("AT2")));
    let h = signed_in_harness(endpoint);
    h.backend.accept("AT2");

    let requests: Vec<_> = (0..10)
        .map(|_| {
            let client = h.client.clone();
            tokio::spawn(async move { client.gateway().send(ApiRequest::get("/me")).await })
        })
        .collect();

    for request in requests {
        assert_eq!(request.await.unwrap().unwrap().status, 200);
    }
    assert_eq!(h.endpoint.refresh_calls(), 1);
    assert_eq!(h.store.get_access().unwrap(), Some("AT2".to_string()));
}

#[tokio::test]
async fn test_rotated_refresh_token_is_used_next_time() {
    let endpoint = FakeEndpoint::new();
    endpoint.push_refresh(Ok(TokenGrant::new("AT2").with_refresh_token("RT2")));
    endpoint.push_refresh(Ok(TokenGrant::new("AT3")));
    let h = signed_in_harness(endpoint);

    h.client.coordinator().refresh_if_needed().await.unwrap();
    assert_eq!(h.store.get_refresh().unwrap(), Some("RT2".to_string()));

    h.client.coordinator().refresh_if_needed().await.unwrap();
    assert_eq!(h.endpoint.received_refresh_tokens(), vec!["RT1", "RT2"]);

    let credential = h.store.credential().unwrap().unwrap();
    assert_eq!(credential.access_token, "AT3");
    assert_eq!(credential.refresh_token, "RT2");
}

#[tokio::test]
async fn test_revoked_refresh_token_signs_out_once() {
    let endpoint = FakeEndpoint::gated();
    endpoint.push_refresh(Err(RefreshError::Rejected {
        status: 400,
        detail: "invalid_grant".to_string(),
    }));
    let h = signed_in_harness(endpoint);

    let state = h.client.restore_session().await.unwrap();
    assert!(state.is_authenticated());

    let signed_out = Arc::new(AtomicUsize::new(0));
    h.client.session().set_listener({
        let signed_out = signed_out.clone();
        Arc::new(move |event: &SessionStateChanged| {
            if event.state == SessionState::Unauthenticated {
                signed_out.fetch_add(1, Ordering::SeqCst);
            }
        })
    });

    // Every request now gets 401.
    h.backend.accept("AT2");
    let requests: Vec<_> = (0..5)
        .map(|_| {
            let client = h.client.clone();
            tokio::spawn(async move { client.gateway().send(ApiRequest::get("/me")).await })
        })
        .collect();

    while h.client.coordinator().waiter_count() < 5 {
        tokio::task::yield_now().await;
    }
    h.endpoint.release(1);

    for request in requests {
        let error = request.await.unwrap().unwrap_err();
        assert!(matches!(error, AuthError::RefreshFailed(_)), "{error:?}");
    }

    assert_eq!(h.endpoint.refresh_calls(), 1);
    assert!(!h.store.has_credential().unwrap());
    assert_eq!(h.client.state(), SessionState::Unauthenticated);
    assert_eq!(signed_out.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_expired_access_token_refreshes_and_retries() {
    let endpoint = FakeEndpoint::new();
    endpoint.push_refresh(Ok(TokenGrant::new("AT3")));
    let h = signed_in_harness(endpoint);
    h.backend.accept("AT3");

    let user = h.client.fetch_profile().await.unwrap();
    assert_eq!(user, test_user());

    let bearers: Vec<_> = h
        .backend
        .requests_to("/me")
        .into_iter()
        .map(|request| request.bearer)
        .collect();
    assert_eq!(bearers, vec![Some("AT1".to_string()), Some("AT3".to_string())]);
    assert_eq!(h.endpoint.refresh_calls(), 1);
}

#[tokio::test]
async fn test_forbidden_is_returned_without_refresh() {
    let h = signed_in_harness(FakeEndpoint::new());
    h.backend
        .route("GET", "/admin", 403, r#"{"detail":"admin only"}"#);

    let response = h
        .client
        .gateway()
        .send(ApiRequest::get("/admin"))
        .await
        .unwrap();

    assert_eq!(response.status, 403);
    assert_eq!(h.endpoint.refresh_calls(), 0);
    assert_eq!(h.backend.requests_to("/admin").len(), 1);
    assert!(h.store.has_credential().unwrap());
}

#[tokio::test]
async fn test_network_failure_keeps_session() {
    let endpoint = FakeEndpoint::new();
    endpoint.push_refresh(Err(RefreshError::Network("connection refused".to_string())));
    let h = signed_in_harness(endpoint);
    h.client.restore_session().await.unwrap();

    h.backend.accept("AT2");
    let error = h.client.fetch_profile().await.unwrap_err();

    assert!(matches!(error, AuthError::NetworkUnavailable));
    assert!(error.is_transient());
    assert_eq!(h.store.get_access().unwrap(), Some("AT1".to_string()));
    assert!(h.client.is_authenticated());
}

#[tokio::test]
async fn test_force_refresh_supersedes_in_flight_round() {
    let endpoint = FakeEndpoint::gated();
    endpoint.push_refresh(Ok(TokenGrant::new("AT-stale")));
    endpoint.push_refresh(Ok(TokenGrant::new("AT-fresh")));
    let h = signed_in_harness(endpoint);

    let waiting = tokio::spawn({
        let client = h.client.clone();
        async move { client.coordinator().refresh_if_needed().await }
    });
    h.endpoint.wait_for_refresh_calls(1).await;

    let forced = tokio::spawn({
        let client = h.client.clone();
        async move { client.coordinator().force_refresh().await }
    });

    // The detached waiter is released right away.
    assert!(matches!(
        waiting.await.unwrap(),
        Err(AuthError::RefreshCancelled)
    ));

    h.endpoint.wait_for_refresh_calls(2).await;
    h.endpoint.release(2);

    assert_eq!(forced.await.unwrap().unwrap(), "AT-fresh");
    assert_eq!(h.endpoint.refresh_calls(), 2);
    assert_eq!(h.store.get_access().unwrap(), Some("AT-fresh".to_string()));
}

#[tokio::test]
async fn test_refresh_without_credential_fails_fast() {
    let h = harness(
        store_with(None),
        FakeBackend::accepting("AT1"),
        FakeEndpoint::new(),
    );

    let error = h.client.coordinator().refresh_if_needed().await.unwrap_err();
    assert!(matches!(error, AuthError::NoRefreshToken));
    assert_eq!(h.endpoint.refresh_calls(), 0);
}
