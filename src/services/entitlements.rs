use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::{
    entities::{entitlement, Entitlement, EntitlementModel},
    errors::ServiceError,
    events::{Event, EventSender},
};

/// A grant row about to be written.
#[derive(Debug, Clone)]
pub struct NewGrant {
    pub buyer_email: String,
    pub course_id: Uuid,
    pub payment_id: String,
}

/// Result of a conditional grant insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The row was written; this delivery won the race.
    Inserted,
    /// A row for the same (payment_id, course_id) already exists — a
    /// redelivered or concurrently delivered notification.
    Duplicate,
}

/// Storage contract for entitlement grants.
///
/// `insert_grant` MUST be a conditional insert keyed on
/// (payment_id, course_id): concurrent inserts for the same key must leave
/// exactly one row and report [`InsertOutcome::Duplicate`] to the losers.
/// That conditional insert, not a lock, is the concurrency control for the
/// whole webhook pipeline.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn has_grant(&self, buyer_email: &str, course_id: Uuid) -> Result<bool, ServiceError>;

    async fn insert_grant(&self, grant: NewGrant) -> Result<InsertOutcome, ServiceError>;

    async fn grants_for(&self, buyer_email: &str) -> Result<Vec<EntitlementModel>, ServiceError>;
}

/// sea-orm implementation backed by the `entitlements` table and its
/// UNIQUE (payment_id, course_id) index.
pub struct SeaOrmEntitlementStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmEntitlementStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EntitlementStore for SeaOrmEntitlementStore {
    async fn has_grant(&self, buyer_email: &str, course_id: Uuid) -> Result<bool, ServiceError> {
        let existing = Entitlement::find()
            .filter(entitlement::Column::BuyerEmail.eq(buyer_email))
            .filter(entitlement::Column::CourseId.eq(course_id))
            .one(&*self.db)
            .await?;
        Ok(existing.is_some())
    }

    async fn insert_grant(&self, grant: NewGrant) -> Result<InsertOutcome, ServiceError> {
        let model = entitlement::ActiveModel {
            id: Set(Uuid::new_v4()),
            buyer_email: Set(grant.buyer_email),
            course_id: Set(grant.course_id),
            payment_id: Set(grant.payment_id),
            granted_at: Set(Utc::now()),
        };

        let insert = Entitlement::insert(model)
            .on_conflict(
                OnConflict::columns([
                    entitlement::Column::PaymentId,
                    entitlement::Column::CourseId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec(&*self.db)
            .await;

        match insert {
            Ok(_) => Ok(InsertOutcome::Inserted),
            // do_nothing() with zero affected rows: the key already exists
            Err(DbErr::RecordNotInserted) => Ok(InsertOutcome::Duplicate),
            Err(err) => Err(err.into()),
        }
    }

    async fn grants_for(&self, buyer_email: &str) -> Result<Vec<EntitlementModel>, ServiceError> {
        Ok(Entitlement::find()
            .filter(entitlement::Column::BuyerEmail.eq(buyer_email))
            .all(&*self.db)
            .await?)
    }
}

/// Outcome of one grant call, per course.
#[derive(Debug, Default, Serialize)]
pub struct GrantOutcome {
    pub granted: Vec<Uuid>,
    pub already_granted: Vec<Uuid>,
    pub duplicate: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

impl GrantOutcome {
    /// True when no course needs the gateway to redeliver this notification.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Grants course access for verified, approved payments.
///
/// The only writer of entitlement rows. Safe under arbitrary redelivery of
/// the same payment notification.
pub struct EntitlementService {
    store: Arc<dyn EntitlementStore>,
    event_sender: Arc<EventSender>,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn EntitlementStore>, event_sender: Arc<EventSender>) -> Self {
        Self {
            store,
            event_sender,
        }
    }

    /// Idempotently grants `course_ids` to `buyer_email` for `payment_id`.
    ///
    /// Each course is handled independently: one failing write never blocks
    /// the others, and the failed subset is picked up again on the
    /// gateway's next redelivery, where the (payment_id, course_id)
    /// conditional insert makes the replay harmless. Courses the buyer
    /// already owns (from an earlier payment) are skipped.
    #[instrument(skip(self, course_ids), fields(courses = course_ids.len()))]
    pub async fn grant(
        &self,
        buyer_email: &str,
        course_ids: &[Uuid],
        payment_id: &str,
    ) -> Result<GrantOutcome, ServiceError> {
        if buyer_email.is_empty() {
            return Err(ServiceError::Integrity(format!(
                "payment {} has no buyer email to grant against",
                payment_id
            )));
        }

        let mut outcome = GrantOutcome::default();

        for &course_id in course_ids {
            match self.grant_one(buyer_email, course_id, payment_id).await {
                Ok(CourseGrant::Granted) => {
                    outcome.granted.push(course_id);
                    self.event_sender
                        .send_or_log(Event::EntitlementGranted {
                            course_id,
                            payment_id: payment_id.to_string(),
                        })
                        .await;
                }
                Ok(CourseGrant::AlreadyOwned) => outcome.already_granted.push(course_id),
                Ok(CourseGrant::DuplicateDelivery) => {
                    // Expected traffic: the gateway redelivers notifications
                    debug!(
                        payment_id = %payment_id,
                        course_id = %course_id,
                        "duplicate delivery, grant already recorded"
                    );
                    outcome.duplicate.push(course_id);
                }
                Err(err) => {
                    error!(
                        payment_id = %payment_id,
                        course_id = %course_id,
                        error = %err,
                        "failed to write grant; awaiting gateway redelivery"
                    );
                    outcome.failed.push(course_id);
                }
            }
        }

        info!(
            payment_id = %payment_id,
            granted = outcome.granted.len(),
            already = outcome.already_granted.len(),
            duplicate = outcome.duplicate.len(),
            failed = outcome.failed.len(),
            "grant pass complete"
        );
        Ok(outcome)
    }

    /// All grants held by a buyer.
    pub async fn grants_for(
        &self,
        buyer_email: &str,
    ) -> Result<Vec<EntitlementModel>, ServiceError> {
        self.store.grants_for(buyer_email).await
    }

    async fn grant_one(
        &self,
        buyer_email: &str,
        course_id: Uuid,
        payment_id: &str,
    ) -> Result<CourseGrant, ServiceError> {
        if self.store.has_grant(buyer_email, course_id).await? {
            return Ok(CourseGrant::AlreadyOwned);
        }

        let inserted = self
            .store
            .insert_grant(NewGrant {
                buyer_email: buyer_email.to_string(),
                course_id,
                payment_id: payment_id.to_string(),
            })
            .await?;

        Ok(match inserted {
            InsertOutcome::Inserted => CourseGrant::Granted,
            InsertOutcome::Duplicate => CourseGrant::DuplicateDelivery,
        })
    }
}

enum CourseGrant {
    Granted,
    AlreadyOwned,
    DuplicateDelivery,
}
