//! Single-flight session verification.
//!
//! Many independent UI regions ask "who is logged in" at once on load. The
//! coordinator answers them all from one in-flight verification instead of
//! one network call per caller: the first caller starts the call, everyone
//! arriving while it is pending awaits the same shared future, and the
//! resolved identity is cached until the credential changes.
//!
//! Explicit `login`/`logout` bump an epoch so a verification that was
//! already in flight when the user acted can never overwrite the newer
//! state when it finally resolves.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use super::SessionIdentity;
use crate::errors::ServiceError;

/// The underlying verification call the coordinator deduplicates.
///
/// `Ok(None)` means the credential is invalid or expired; `Err` means the
/// check itself failed. The coordinator treats both as "not logged in",
/// because an identity that cannot be verified must not be trusted.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Option<SessionIdentity>, ServiceError>;
}

/// Verifier backed by `GET /auth/me` over HTTP.
pub struct HttpSessionVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSessionVerifier {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client build: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SessionVerifier for HttpSessionVerifier {
    async fn verify(&self, credential: &str) -> Result<Option<SessionIdentity>, ServiceError> {
        let response = self
            .client
            .get(format!("{}/auth/me", self.base_url))
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| ServiceError::Gateway(format!("identity check failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ServiceError::Gateway(format!(
                "identity check returned {}",
                response.status()
            )));
        }

        let identity: SessionIdentity = response
            .json()
            .await
            .map_err(|e| ServiceError::Gateway(format!("identity body: {}", e)))?;
        Ok(Some(identity))
    }
}

type VerifyFuture = Shared<BoxFuture<'static, Option<SessionIdentity>>>;

enum CoordinatorState {
    Idle,
    Verifying(VerifyFuture),
    Authenticated(SessionIdentity),
    Unauthenticated,
}

struct Inner {
    state: CoordinatorState,
    credential: Option<String>,
    epoch: u64,
}

/// Coalesces concurrent identity checks into one verification call.
///
/// Scoped to a single client instance; the shared in-flight future is the
/// only mutable state and lives behind one lock.
pub struct SessionCoordinator {
    verifier: Arc<dyn SessionVerifier>,
    inner: Mutex<Inner>,
}

impl SessionCoordinator {
    /// A fresh coordinator with no credential: cold start.
    pub fn new(verifier: Arc<dyn SessionVerifier>) -> Self {
        Self {
            verifier,
            inner: Mutex::new(Inner {
                state: CoordinatorState::Idle,
                credential: None,
                epoch: 0,
            }),
        }
    }

    /// Installs a stored credential (e.g. read back from disk on startup)
    /// without trusting it yet: the next identity check verifies it.
    pub fn set_credential(&self, credential: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.credential = Some(credential.into());
        inner.state = CoordinatorState::Idle;
        inner.epoch += 1;
    }

    /// An explicit login just completed: the identity is known, no
    /// verification round-trip is needed, and any stale in-flight
    /// verification is disarmed.
    pub fn on_login(&self, credential: impl Into<String>, identity: SessionIdentity) {
        let mut inner = self.inner.lock().unwrap();
        inner.credential = Some(credential.into());
        inner.state = CoordinatorState::Authenticated(identity);
        inner.epoch += 1;
    }

    /// An explicit logout: drop the credential and disarm any in-flight
    /// verification.
    pub fn on_logout(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.credential = None;
        inner.state = CoordinatorState::Unauthenticated;
        inner.epoch += 1;
    }

    /// Resolves the current identity, deduplicating concurrent callers
    /// into a single underlying verification call.
    pub async fn current_identity(&self) -> Option<SessionIdentity> {
        let (future, epoch) = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.state {
                CoordinatorState::Authenticated(identity) => return Some(identity.clone()),
                CoordinatorState::Unauthenticated => return None,
                CoordinatorState::Verifying(shared) => (shared.clone(), inner.epoch),
                CoordinatorState::Idle => {
                    let Some(credential) = inner.credential.clone() else {
                        inner.state = CoordinatorState::Unauthenticated;
                        return None;
                    };

                    let verifier = Arc::clone(&self.verifier);
                    let future: VerifyFuture = async move {
                        match verifier.verify(&credential).await {
                            Ok(identity) => identity,
                            Err(err) => {
                                debug!(error = %err, "session verification failed");
                                None
                            }
                        }
                    }
                    .boxed()
                    .shared();

                    inner.state = CoordinatorState::Verifying(future.clone());
                    (future, inner.epoch)
                }
            }
        };

        let result = future.await;

        let mut inner = self.inner.lock().unwrap();
        // Commit only if no login/logout/credential change raced us;
        // otherwise this resolution is stale and is discarded.
        if inner.epoch == epoch && matches!(inner.state, CoordinatorState::Verifying(_)) {
            match &result {
                Some(identity) => {
                    inner.state = CoordinatorState::Authenticated(identity.clone());
                }
                None => {
                    inner.state = CoordinatorState::Unauthenticated;
                    inner.credential = None;
                }
            }
        }

        result
    }

    /// Current state, for diagnostics and tests.
    pub fn state_label(&self) -> &'static str {
        match self.inner.lock().unwrap().state {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Verifying(_) => "verifying",
            CoordinatorState::Authenticated(_) => "authenticated",
            CoordinatorState::Unauthenticated => "unauthenticated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::UserRole;
    use crate::test_support::CountingVerifier;
    use std::time::Duration;
    use uuid::Uuid;

    fn identity() -> SessionIdentity {
        SessionIdentity {
            user_id: Uuid::new_v4(),
            email: "ana@example.com".into(),
            role: UserRole::Buyer,
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_verification_call() {
        let expected = identity();
        let verifier = Arc::new(CountingVerifier::resolving_to(
            Some(expected.clone()),
            Duration::from_millis(50),
        ));
        let coordinator = Arc::new(SessionCoordinator::new(verifier.clone()));
        coordinator.set_credential("token-1");

        let mut handles = Vec::new();
        for _ in 0..3 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(
                async move { coordinator.current_identity().await },
            ));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(expected.clone()));
        }
        assert_eq!(verifier.calls(), 1);
        assert_eq!(coordinator.state_label(), "authenticated");
    }

    #[tokio::test]
    async fn resolved_identity_is_cached_for_later_callers() {
        let verifier = Arc::new(CountingVerifier::resolving_to(
            Some(identity()),
            Duration::ZERO,
        ));
        let coordinator = SessionCoordinator::new(verifier.clone());
        coordinator.set_credential("token-1");

        assert!(coordinator.current_identity().await.is_some());
        assert!(coordinator.current_identity().await.is_some());
        assert_eq!(verifier.calls(), 1);
    }

    #[tokio::test]
    async fn failed_verification_clears_the_credential() {
        let verifier = Arc::new(CountingVerifier::resolving_to(None, Duration::ZERO));
        let coordinator = SessionCoordinator::new(verifier.clone());
        coordinator.set_credential("expired-token");

        assert_eq!(coordinator.current_identity().await, None);
        assert_eq!(coordinator.state_label(), "unauthenticated");

        // The dead credential is gone: no further network calls
        assert_eq!(coordinator.current_identity().await, None);
        assert_eq!(verifier.calls(), 1);
    }

    #[tokio::test]
    async fn no_credential_means_no_network_call() {
        let verifier = Arc::new(CountingVerifier::resolving_to(
            Some(identity()),
            Duration::ZERO,
        ));
        let coordinator = SessionCoordinator::new(verifier.clone());

        assert_eq!(coordinator.current_identity().await, None);
        assert_eq!(verifier.calls(), 0);
    }

    #[tokio::test]
    async fn login_during_inflight_verification_wins() {
        let stale = identity();
        let verifier = Arc::new(CountingVerifier::resolving_to(
            Some(stale),
            Duration::from_millis(100),
        ));
        let coordinator = Arc::new(SessionCoordinator::new(verifier));
        coordinator.set_credential("old-token");

        let racing = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.current_identity().await })
        };

        // Give the verification time to start, then log in explicitly
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = identity();
        coordinator.on_login("new-token", fresh.clone());

        // The stale resolution must not overwrite the explicit login
        racing.await.unwrap();
        assert_eq!(coordinator.current_identity().await, Some(fresh));
        assert_eq!(coordinator.state_label(), "authenticated");
    }

    #[tokio::test]
    async fn logout_during_inflight_verification_wins() {
        let verifier = Arc::new(CountingVerifier::resolving_to(
            Some(identity()),
            Duration::from_millis(100),
        ));
        let coordinator = Arc::new(SessionCoordinator::new(verifier));
        coordinator.set_credential("token-1");

        let racing = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.current_identity().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.on_logout();

        racing.await.unwrap();
        assert_eq!(coordinator.current_identity().await, None);
        assert_eq!(coordinator.state_label(), "unauthenticated");
    }

    #[tokio::test]
    async fn http_verifier_resolves_identity_and_maps_401_to_none() {
        use wiremock::matchers::{bearer_token, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let expected = identity();
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .and(bearer_token("good-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&expected))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let verifier =
            HttpSessionVerifier::new(server.uri(), Duration::from_secs(2)).unwrap();

        let resolved = verifier.verify("good-token").await.unwrap();
        assert_eq!(resolved, Some(expected));

        let rejected = verifier.verify("bad-token").await.unwrap();
        assert_eq!(rejected, None);
    }

    #[tokio::test]
    async fn logout_then_new_login_starts_a_fresh_session() {
        let verifier = Arc::new(CountingVerifier::resolving_to(
            Some(identity()),
            Duration::ZERO,
        ));
        let coordinator = SessionCoordinator::new(verifier);
        let first = identity();
        coordinator.on_login("token-1", first.clone());
        assert_eq!(coordinator.current_identity().await, Some(first));

        coordinator.on_logout();
        assert_eq!(coordinator.current_identity().await, None);

        let second = identity();
        coordinator.on_login("token-2", second.clone());
        assert_eq!(coordinator.current_identity().await, Some(second));
    }
}
