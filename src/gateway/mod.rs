//! Payment gateway integration.
//!
//! The storefront never settles money itself: it declares what is being
//! bought as a gateway *preference*, redirects the buyer, and later verifies
//! payment notifications against the gateway's own records. Notification
//! payloads are spoofable, so the fetched [`PaymentRecord`] is the only
//! trusted view of a payment.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

mod http;

pub use http::HttpPaymentGateway;

/// Client for the external payment gateway's REST API.
///
/// `get_payment` returns `Ok(None)` for an id the gateway does not know
/// (an unresolvable notification, dropped by the ingestor) and reserves
/// `Err` for transport-level failures.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<CreatedPreference, ServiceError>;

    async fn get_payment(&self, payment_id: &str) -> Result<Option<PaymentRecord>, ServiceError>;
}

/// One purchasable line inside a preference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceItem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub unit_price: Decimal,
    pub currency_id: String,
    pub quantity: i32,
}

/// Redirect targets for the three payment outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

/// Opaque metadata the gateway echoes back unmodified on the payment
/// record. This is the only channel used to attribute a payment to a buyer
/// and their purchased courses; it is never reconstructed from headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreferenceMetadata {
    #[serde(default)]
    pub buyer_email: Option<String>,
    #[serde(default)]
    pub course_ids: Vec<Uuid>,
    #[serde(default)]
    pub cart_id: Option<Uuid>,
}

/// Server-side declaration of a pending payment, created with the gateway
/// before redirecting the buyer. Built once per checkout attempt and never
/// reused across attempts.
#[derive(Debug, Clone, Serialize)]
pub struct PreferenceRequest {
    pub items: Vec<PreferenceItem>,
    pub payer_email: String,
    pub back_urls: BackUrls,
    pub notification_url: String,
    pub metadata: PreferenceMetadata,
}

/// Gateway response to preference creation. `init_point` is the URL the
/// buyer is redirected to; a response without one is unusable.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatedPreference {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub init_point: Option<String>,
}

/// Payment status as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    Approved,
    Pending,
    Rejected,
    Other(String),
}

impl PaymentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Approved => "approved",
            Self::Pending => "pending",
            Self::Rejected => "rejected",
            Self::Other(raw) => raw.as_str(),
        }
    }
}

impl From<&str> for PaymentStatus {
    fn from(raw: &str) -> Self {
        match raw {
            "approved" => Self::Approved,
            // the gateway reports both while a payment is unsettled
            "pending" | "in_process" => Self::Pending,
            "rejected" => Self::Rejected,
            other => Self::Other(other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for PaymentStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(PaymentStatus::from(raw.as_str()))
    }
}

/// The gateway's authoritative record of a payment, fetched by id. The
/// single source of truth for whether a sale occurred.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub metadata: PreferenceMetadata,
}

impl PaymentRecord {
    pub fn is_approved(&self) -> bool {
        self.status == PaymentStatus::Approved
    }
}

/// The gateway serializes payment ids as numbers and preference ids as
/// strings; accept either.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(i64),
    }

    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => Ok(s),
        StringOrNumber::Number(n) => Ok(n.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_status_maps_gateway_strings() {
        assert_eq!(PaymentStatus::from("approved"), PaymentStatus::Approved);
        assert_eq!(PaymentStatus::from("pending"), PaymentStatus::Pending);
        assert_eq!(PaymentStatus::from("in_process"), PaymentStatus::Pending);
        assert_eq!(PaymentStatus::from("rejected"), PaymentStatus::Rejected);
        assert_eq!(
            PaymentStatus::from("charged_back"),
            PaymentStatus::Other("charged_back".to_string())
        );
    }

    #[test]
    fn payment_record_deserializes_numeric_id() {
        let json = r#"{
            "id": 1310422398,
            "status": "approved",
            "metadata": {
                "buyer_email": "ana@example.com",
                "course_ids": ["550e8400-e29b-41d4-a716-446655440000"]
            }
        }"#;

        let record: PaymentRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, "1310422398");
        assert!(record.is_approved());
        assert_eq!(record.metadata.buyer_email.as_deref(), Some("ana@example.com"));
        assert_eq!(record.metadata.course_ids.len(), 1);
    }

    #[test]
    fn payment_record_tolerates_missing_metadata() {
        let json = r#"{"id": "77", "status": "pending"}"#;
        let record: PaymentRecord = serde_json::from_str(json).unwrap();
        assert!(!record.is_approved());
        assert!(record.metadata.buyer_email.is_none());
        assert!(record.metadata.course_ids.is_empty());
    }

    #[test]
    fn created_preference_without_redirect_url() {
        let json = r#"{"id": "pref-123"}"#;
        let created: CreatedPreference = serde_json::from_str(json).unwrap();
        assert_eq!(created.id, "pref-123");
        assert!(created.init_point.is_none());
    }
}
