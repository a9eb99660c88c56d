//! In-memory doubles for the crate's seams, shared between unit tests and
//! the integration tests under `tests/`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::auth::session::SessionVerifier;
use crate::auth::SessionIdentity;
use crate::entities::EntitlementModel;
use crate::errors::ServiceError;
use crate::gateway::{CreatedPreference, PaymentGateway, PaymentRecord, PreferenceRequest};
use crate::services::entitlements::{EntitlementStore, InsertOutcome, NewGrant};

/// Entitlement store with the same conditional-insert semantics as the
/// database-backed one: the (payment_id, course_id) key decides duplicates
/// under one lock, so concurrent grants race exactly like the UNIQUE index.
#[derive(Default)]
pub struct InMemoryEntitlementStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    rows: Vec<EntitlementModel>,
    keys: HashSet<(String, Uuid)>,
    failing_courses: HashSet<Uuid>,
}

impl InMemoryEntitlementStore {
    /// Number of grant rows written so far.
    pub fn grant_count(&self) -> usize {
        self.inner.lock().unwrap().rows.len()
    }

    /// All rows, cloned, for assertions.
    pub fn rows(&self) -> Vec<EntitlementModel> {
        self.inner.lock().unwrap().rows.clone()
    }

    /// Make inserts for `course_id` fail until [`Self::heal`] is called.
    pub fn fail_on(&self, course_id: Uuid) {
        self.inner.lock().unwrap().failing_courses.insert(course_id);
    }

    pub fn heal(&self, course_id: Uuid) {
        self.inner.lock().unwrap().failing_courses.remove(&course_id);
    }
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn has_grant(&self, buyer_email: &str, course_id: Uuid) -> Result<bool, ServiceError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rows
            .iter()
            .any(|row| row.buyer_email == buyer_email && row.course_id == course_id))
    }

    async fn insert_grant(&self, grant: NewGrant) -> Result<InsertOutcome, ServiceError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.failing_courses.contains(&grant.course_id) {
            return Err(ServiceError::db_error("simulated write failure"));
        }

        let key = (grant.payment_id.clone(), grant.course_id);
        if !inner.keys.insert(key) {
            return Ok(InsertOutcome::Duplicate);
        }

        inner.rows.push(EntitlementModel {
            id: Uuid::new_v4(),
            buyer_email: grant.buyer_email,
            course_id: grant.course_id,
            payment_id: grant.payment_id,
            granted_at: Utc::now(),
        });
        Ok(InsertOutcome::Inserted)
    }

    async fn grants_for(&self, buyer_email: &str) -> Result<Vec<EntitlementModel>, ServiceError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rows
            .iter()
            .filter(|row| row.buyer_email == buyer_email)
            .cloned()
            .collect())
    }
}

/// Scriptable payment gateway. Records every call so tests can assert how
/// many times the real gateway would have been hit.
pub struct MockGateway {
    preference_calls: AtomicUsize,
    payment_calls: AtomicUsize,
    preference_response: Mutex<Option<Result<CreatedPreference, String>>>,
    payments: Mutex<Vec<PaymentRecord>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self {
            preference_calls: AtomicUsize::new(0),
            payment_calls: AtomicUsize::new(0),
            preference_response: Mutex::new(Some(Ok(CreatedPreference {
                id: "pref-test".to_string(),
                init_point: Some("https://gateway.test/redirect/pref-test".to_string()),
            }))),
            payments: Mutex::new(Vec::new()),
        }
    }
}

impl MockGateway {
    /// Scripts the next preference-creation response.
    pub fn set_preference_response(&self, response: Result<CreatedPreference, String>) {
        *self.preference_response.lock().unwrap() = Some(response);
    }

    /// Registers a payment record the mock will serve by id.
    pub fn register_payment(&self, record: PaymentRecord) {
        self.payments.lock().unwrap().push(record);
    }

    pub fn preference_calls(&self) -> usize {
        self.preference_calls.load(Ordering::SeqCst)
    }

    pub fn payment_calls(&self) -> usize {
        self.payment_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_preference(
        &self,
        _request: &PreferenceRequest,
    ) -> Result<CreatedPreference, ServiceError> {
        self.preference_calls.fetch_add(1, Ordering::SeqCst);
        match self.preference_response.lock().unwrap().clone() {
            Some(Ok(created)) => Ok(created),
            Some(Err(message)) => Err(ServiceError::Gateway(message)),
            None => Err(ServiceError::Gateway("no scripted response".to_string())),
        }
    }

    async fn get_payment(&self, payment_id: &str) -> Result<Option<PaymentRecord>, ServiceError> {
        self.payment_calls.fetch_add(1, Ordering::SeqCst);
        let payments = self.payments.lock().unwrap();
        Ok(payments.iter().find(|p| p.id == payment_id).cloned())
    }
}

/// Session verifier that resolves after a configurable delay and counts
/// its calls, for asserting the coordinator's single-flight guarantee.
pub struct CountingVerifier {
    calls: AtomicUsize,
    identity: Mutex<Option<SessionIdentity>>,
    delay: Duration,
}

impl CountingVerifier {
    pub fn resolving_to(identity: Option<SessionIdentity>, delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            identity: Mutex::new(identity),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionVerifier for CountingVerifier {
    async fn verify(&self, _credential: &str) -> Result<Option<SessionIdentity>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.identity.lock().unwrap().clone())
    }
}
