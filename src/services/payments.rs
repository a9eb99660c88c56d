use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::PaymentGateway,
    services::entitlements::{EntitlementService, GrantOutcome},
};

/// The notification envelope the gateway POSTs to the webhook endpoint.
/// Untrusted input: only the event type and the payment id are read, and
/// the id is only ever used to fetch the authoritative record.
#[derive(Debug, Deserialize)]
pub struct WebhookNotification {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub id: Value,
}

impl WebhookNotification {
    fn is_payment_event(&self) -> bool {
        self.kind == "payment" || self.kind.starts_with("payment.")
    }

    fn payment_id(&self) -> Option<String> {
        match &self.data.id {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// What the ingest pass decided. Every variant is acknowledged with a 2xx;
/// the distinction exists for logging, tests, and the follow-up cart
/// conversion.
#[derive(Debug)]
pub enum WebhookDisposition {
    /// Not a payment event, or the id was missing/unresolvable.
    Ignored { reason: String },
    /// The authoritative record exists but is not approved.
    NotApproved { payment_id: String, status: String },
    /// Approved record missing buyer email or purchased courses.
    IntegrityFailure { payment_id: String, reason: String },
    /// Grants were attempted; the cart (if known) can be converted.
    Granted {
        payment_id: String,
        buyer_email: String,
        cart_id: Option<Uuid>,
        outcome: GrantOutcome,
    },
}

/// Webhook ingest pipeline.
///
/// The notification body is never trusted: the declared payment id is
/// re-fetched from the gateway, and only the fetched record drives
/// entitlement decisions. Anything non-actionable is logged and dropped so
/// the gateway is not goaded into an endless redelivery loop; redelivery of
/// actionable events is safe because granting is idempotent.
pub struct PaymentWebhookService {
    gateway: Arc<dyn PaymentGateway>,
    entitlements: Arc<EntitlementService>,
    event_sender: Arc<EventSender>,
}

impl PaymentWebhookService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        entitlements: Arc<EntitlementService>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            gateway,
            entitlements,
            event_sender,
        }
    }

    /// Processes one gateway notification.
    ///
    /// Returns `Err` only for failures the caller should surface as
    /// non-2xx (none today beyond gateway transport errors, which are
    /// swallowed into `Ignored` so the gateway retries on its own
    /// schedule).
    #[instrument(skip(self, notification), fields(kind = %notification.kind))]
    pub async fn process(
        &self,
        notification: &WebhookNotification,
    ) -> Result<WebhookDisposition, ServiceError> {
        if !notification.is_payment_event() {
            info!(kind = %notification.kind, "ignoring non-payment notification");
            return Ok(WebhookDisposition::Ignored {
                reason: format!("non-payment event type '{}'", notification.kind),
            });
        }

        let Some(payment_id) = notification.payment_id() else {
            warn!("payment notification without a usable id");
            return Ok(WebhookDisposition::Ignored {
                reason: "payment notification without a usable id".to_string(),
            });
        };

        // The authoritative record. A lookup miss is expected traffic
        // (stale or malformed notifications); a transport failure is also
        // dropped here — the gateway redelivers, and granting is idempotent.
        let record = match self.gateway.get_payment(&payment_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(payment_id = %payment_id, "payment id not resolvable at the gateway");
                return Ok(WebhookDisposition::Ignored {
                    reason: format!("payment {} not found at the gateway", payment_id),
                });
            }
            Err(err) => {
                warn!(payment_id = %payment_id, error = %err, "payment lookup failed; awaiting redelivery");
                return Ok(WebhookDisposition::Ignored {
                    reason: format!("payment {} lookup failed", payment_id),
                });
            }
        };

        if !record.is_approved() {
            info!(
                payment_id = %payment_id,
                status = record.status.as_str(),
                "payment not approved; no entitlement action"
            );
            self.event_sender
                .send_or_log(Event::PaymentIgnored {
                    payment_id: payment_id.clone(),
                    status: record.status.as_str().to_string(),
                })
                .await;
            return Ok(WebhookDisposition::NotApproved {
                payment_id,
                status: record.status.as_str().to_string(),
            });
        }

        let buyer_email = record
            .metadata
            .buyer_email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty());

        let (buyer_email, course_ids) = match (buyer_email, &record.metadata.course_ids) {
            (Some(email), course_ids) if !course_ids.is_empty() => {
                (email.to_string(), course_ids.clone())
            }
            (email, course_ids) => {
                let reason = format!(
                    "approved payment {} is missing {}",
                    payment_id,
                    match (email, course_ids.is_empty()) {
                        (None, true) => "buyer email and purchased courses",
                        (None, false) => "buyer email",
                        (Some(_), _) => "purchased courses",
                    }
                );
                // Operator-visible: money moved but attribution data is
                // broken. Still acknowledged, or the gateway would retry
                // forever with the same broken record.
                error!(payment_id = %payment_id, "{}", reason);
                return Ok(WebhookDisposition::IntegrityFailure { payment_id, reason });
            }
        };

        self.event_sender
            .send_or_log(Event::PaymentApproved {
                payment_id: payment_id.clone(),
            })
            .await;

        let outcome = self
            .entitlements
            .grant(&buyer_email, &course_ids, &payment_id)
            .await?;

        Ok(WebhookDisposition::Granted {
            payment_id,
            buyer_email,
            cart_id: record.metadata.cart_id,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSender;
    use crate::gateway::{PaymentRecord, PaymentStatus, PreferenceMetadata};
    use crate::test_support::{InMemoryEntitlementStore, MockGateway};
    use tokio::sync::mpsc;

    fn notification(kind: &str, id: Value) -> WebhookNotification {
        WebhookNotification {
            kind: kind.to_string(),
            data: WebhookData { id },
        }
    }

    fn approved_record(id: &str, email: Option<&str>, courses: Vec<Uuid>) -> PaymentRecord {
        PaymentRecord {
            id: id.to_string(),
            status: PaymentStatus::Approved,
            metadata: PreferenceMetadata {
                buyer_email: email.map(str::to_string),
                course_ids: courses,
                cart_id: None,
            },
        }
    }

    fn build(
        gateway: Arc<MockGateway>,
        store: Arc<InMemoryEntitlementStore>,
    ) -> PaymentWebhookService {
        let (tx, _rx) = mpsc::channel(64);
        let sender = Arc::new(EventSender::new(tx));
        let entitlements = Arc::new(EntitlementService::new(store, sender.clone()));
        PaymentWebhookService::new(gateway, entitlements, sender)
    }

    #[tokio::test]
    async fn non_payment_event_is_dropped_without_gateway_lookup() {
        let gateway = Arc::new(MockGateway::default());
        let store = Arc::new(InMemoryEntitlementStore::default());
        let service = build(gateway.clone(), store.clone());

        let disposition = service
            .process(&notification("plan", Value::String("9".into())))
            .await
            .unwrap();

        assert!(matches!(disposition, WebhookDisposition::Ignored { .. }));
        assert_eq!(gateway.payment_calls(), 0);
        assert_eq!(store.grant_count(), 0);
    }

    #[tokio::test]
    async fn unresolvable_payment_id_is_dropped() {
        let gateway = Arc::new(MockGateway::default());
        let store = Arc::new(InMemoryEntitlementStore::default());
        let service = build(gateway.clone(), store.clone());

        let disposition = service
            .process(&notification("payment", Value::String("ghost".into())))
            .await
            .unwrap();

        assert!(matches!(disposition, WebhookDisposition::Ignored { .. }));
        assert_eq!(gateway.payment_calls(), 1);
        assert_eq!(store.grant_count(), 0);
    }

    #[tokio::test]
    async fn pending_payment_grants_nothing() {
        let gateway = Arc::new(MockGateway::default());
        gateway.register_payment(PaymentRecord {
            id: "123".to_string(),
            status: PaymentStatus::Pending,
            metadata: PreferenceMetadata {
                buyer_email: Some("ana@example.com".into()),
                course_ids: vec![Uuid::new_v4()],
                cart_id: None,
            },
        });
        let store = Arc::new(InMemoryEntitlementStore::default());
        let service = build(gateway, store.clone());

        let disposition = service
            .process(&notification("payment", Value::String("123".into())))
            .await
            .unwrap();

        assert!(matches!(
            disposition,
            WebhookDisposition::NotApproved { ref status, .. } if status == "pending"
        ));
        assert_eq!(store.grant_count(), 0);
    }

    #[tokio::test]
    async fn approved_payment_without_email_is_an_integrity_failure() {
        let gateway = Arc::new(MockGateway::default());
        gateway.register_payment(approved_record("123", None, vec![Uuid::new_v4()]));
        let store = Arc::new(InMemoryEntitlementStore::default());
        let service = build(gateway, store.clone());

        let disposition = service
            .process(&notification("payment", Value::String("123".into())))
            .await
            .unwrap();

        assert!(matches!(
            disposition,
            WebhookDisposition::IntegrityFailure { .. }
        ));
        assert_eq!(store.grant_count(), 0);
    }

    #[tokio::test]
    async fn approved_payment_without_courses_is_an_integrity_failure() {
        let gateway = Arc::new(MockGateway::default());
        gateway.register_payment(approved_record("123", Some("ana@example.com"), vec![]));
        let store = Arc::new(InMemoryEntitlementStore::default());
        let service = build(gateway, store.clone());

        let disposition = service
            .process(&notification("payment", Value::String("123".into())))
            .await
            .unwrap();

        assert!(matches!(
            disposition,
            WebhookDisposition::IntegrityFailure { .. }
        ));
    }

    #[tokio::test]
    async fn approved_payment_grants_each_course() {
        let courses = vec![Uuid::new_v4(), Uuid::new_v4()];
        let gateway = Arc::new(MockGateway::default());
        gateway.register_payment(approved_record(
            "123",
            Some("ana@example.com"),
            courses.clone(),
        ));
        let store = Arc::new(InMemoryEntitlementStore::default());
        let service = build(gateway, store.clone());

        let disposition = service
            .process(&notification("payment", Value::Number(123.into())))
            .await
            .unwrap();

        match disposition {
            WebhookDisposition::Granted {
                buyer_email,
                outcome,
                ..
            } => {
                assert_eq!(buyer_email, "ana@example.com");
                assert_eq!(outcome.granted.len(), 2);
            }
            other => panic!("unexpected disposition: {:?}", other),
        }
        assert_eq!(store.grant_count(), 2);
    }

    #[tokio::test]
    async fn duplicate_delivery_grants_exactly_once() {
        let courses = vec![Uuid::new_v4(), Uuid::new_v4()];
        let gateway = Arc::new(MockGateway::default());
        gateway.register_payment(approved_record(
            "123",
            Some("ana@example.com"),
            courses.clone(),
        ));
        let store = Arc::new(InMemoryEntitlementStore::default());
        let service = build(gateway, store.clone());

        let envelope = notification("payment", Value::String("123".into()));
        service.process(&envelope).await.unwrap();
        service.process(&envelope).await.unwrap();

        // two deliveries, two courses: exactly two rows, not four
        assert_eq!(store.grant_count(), 2);
    }
}
