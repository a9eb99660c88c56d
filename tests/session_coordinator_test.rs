//! Session coordinator contract: concurrent identity checks share one
//! verification call, and explicit login/logout always win over stale
//! in-flight verifications.

use std::sync::Arc;
use std::time::Duration;

use courseloft_api::auth::{session::SessionCoordinator, SessionIdentity};
use courseloft_api::entities::UserRole;
use courseloft_api::test_support::CountingVerifier;
use uuid::Uuid;

fn identity(email: &str) -> SessionIdentity {
    SessionIdentity {
        user_id: Uuid::new_v4(),
        email: email.to_string(),
        role: UserRole::Buyer,
    }
}

#[tokio::test]
async fn three_concurrent_callers_one_network_call() {
    let expected = identity("ana@example.com");
    let verifier = Arc::new(CountingVerifier::resolving_to(
        Some(expected.clone()),
        Duration::from_millis(40),
    ));
    let coordinator = Arc::new(SessionCoordinator::new(verifier.clone()));
    coordinator.set_credential("stored-token");

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.current_identity().await })
        })
        .collect();

    for handle in handles {
        let resolved = handle.await.unwrap();
        assert_eq!(resolved, Some(expected.clone()));
    }

    assert_eq!(verifier.calls(), 1);
}

#[tokio::test]
async fn identity_is_served_from_cache_after_resolution() {
    let verifier = Arc::new(CountingVerifier::resolving_to(
        Some(identity("ana@example.com")),
        Duration::ZERO,
    ));
    let coordinator = SessionCoordinator::new(verifier.clone());
    coordinator.set_credential("stored-token");

    for _ in 0..5 {
        assert!(coordinator.current_identity().await.is_some());
    }
    assert_eq!(verifier.calls(), 1);
}

#[tokio::test]
async fn explicit_login_beats_stale_inflight_verification() {
    let verifier = Arc::new(CountingVerifier::resolving_to(
        Some(identity("old@example.com")),
        Duration::from_millis(80),
    ));
    let coordinator = Arc::new(SessionCoordinator::new(verifier));
    coordinator.set_credential("old-token");

    // Kick off a verification and let it get in flight
    let inflight = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.current_identity().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The user logs in while the old check is still pending
    let fresh = identity("new@example.com");
    coordinator.on_login("new-token", fresh.clone());
    inflight.await.unwrap();

    assert_eq!(coordinator.current_identity().await, Some(fresh));
}

#[tokio::test]
async fn logout_clears_identity_and_stops_network_calls() {
    let verifier = Arc::new(CountingVerifier::resolving_to(
        Some(identity("ana@example.com")),
        Duration::ZERO,
    ));
    let coordinator = SessionCoordinator::new(verifier.clone());
    coordinator.set_credential("stored-token");

    assert!(coordinator.current_identity().await.is_some());
    coordinator.on_logout();

    assert_eq!(coordinator.current_identity().await, None);
    assert_eq!(coordinator.current_identity().await, None);
    // Only the initial pre-logout verification ever hit the network
    assert_eq!(verifier.calls(), 1);
}
