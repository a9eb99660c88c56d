use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::cart_item,
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::{BackUrls, PaymentGateway, PreferenceItem, PreferenceMetadata, PreferenceRequest},
    services::carts::{CartService, CartWithItems},
};

const DEFAULT_LOCALE: &str = "es";

/// The buyer on whose behalf a checkout runs. The email must have been
/// verified by the auth layer; the builder only checks presence.
#[derive(Debug, Clone)]
pub struct CheckoutIdentity {
    pub user_id: Uuid,
    pub email: Option<String>,
}

/// Result of a successful preference creation.
#[derive(Debug, Serialize)]
pub struct CheckoutRedirect {
    pub url: String,
    pub preference_id: String,
}

/// Builds payment-gateway preferences out of carts.
///
/// One invocation makes exactly one gateway call; a retried checkout builds
/// a brand-new preference. Validation failures (`EmptyCart`,
/// `MissingIdentity`) are reported before any gateway traffic, and the cart
/// is left untouched — only a confirmed payment clears it.
pub struct PreferenceBuilder {
    carts: Arc<CartService>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl PreferenceBuilder {
    pub fn new(
        carts: Arc<CartService>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            carts,
            gateway,
            event_sender,
            config,
        }
    }

    /// Creates a gateway preference for the cart and returns the redirect
    /// URL the buyer should be sent to.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn build_preference(
        &self,
        cart_id: Uuid,
        identity: &CheckoutIdentity,
        locale: Option<&str>,
    ) -> Result<CheckoutRedirect, ServiceError> {
        let buyer_email = match identity.email.as_deref() {
            Some(email) if !email.trim().is_empty() => email.to_string(),
            _ => return Err(ServiceError::MissingIdentity),
        };

        let CartWithItems { items, .. } = self.carts.get_cart(cart_id).await?;

        let request = assemble_request(AssembleInput {
            cart_id,
            items: &items,
            buyer_email,
            checkout_currency: &self.config.checkout_currency,
            public_base_url: self.config.public_base_url(),
            locale,
        })?;

        let created = self.gateway.create_preference(&request).await?;
        let redirect = redirect_from(created)?;

        self.event_sender
            .send_or_log(Event::CheckoutStarted {
                cart_id,
                preference_id: redirect.preference_id.clone(),
            })
            .await;

        info!(cart_id = %cart_id, preference_id = %redirect.preference_id, "checkout preference created");
        Ok(redirect)
    }
}

/// A created preference is only usable if the gateway returned somewhere to
/// send the buyer. Anything else is fatal for this attempt; the buyer
/// retries the whole checkout with a fresh preference.
fn redirect_from(created: crate::gateway::CreatedPreference) -> Result<CheckoutRedirect, ServiceError> {
    let url = created.init_point.filter(|u| !u.is_empty()).ok_or_else(|| {
        ServiceError::GatewayResponse(format!("preference {} has no redirect URL", created.id))
    })?;

    Ok(CheckoutRedirect {
        url,
        preference_id: created.id,
    })
}

pub(crate) struct AssembleInput<'a> {
    pub cart_id: Uuid,
    pub items: &'a [cart_item::Model],
    pub buyer_email: String,
    pub checkout_currency: &'a str,
    pub public_base_url: &'a str,
    pub locale: Option<&'a str>,
}

/// Turns cart lines into the gateway request. Lines priced outside the
/// checkout currency never reach the gateway; if nothing is left the
/// checkout fails with `EmptyCart` before any remote call.
pub(crate) fn assemble_request(input: AssembleInput<'_>) -> Result<PreferenceRequest, ServiceError> {
    let eligible: Vec<_> = input
        .items
        .iter()
        .filter(|item| item.currency == input.checkout_currency)
        .collect();

    if eligible.is_empty() {
        return Err(ServiceError::EmptyCart);
    }

    let items: Vec<PreferenceItem> = eligible
        .iter()
        .map(|item| PreferenceItem {
            id: item.course_id.to_string(),
            title: item.title.clone(),
            description: format!("Acceso al curso: {}", item.title),
            unit_price: item.unit_price,
            currency_id: item.currency.clone(),
            quantity: item.quantity,
        })
        .collect();

    let course_ids: Vec<Uuid> = eligible.iter().map(|item| item.course_id).collect();

    let locale = input
        .locale
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or(DEFAULT_LOCALE);
    let base = input.public_base_url;

    Ok(PreferenceRequest {
        items,
        payer_email: input.buyer_email.clone(),
        back_urls: BackUrls {
            success: format!("{}/{}/checkout/success", base, locale),
            failure: format!("{}/{}/checkout/failure", base, locale),
            pending: format!("{}/{}/checkout/pending", base, locale),
        },
        notification_url: format!("{}/api/v1/payments/webhook", base),
        metadata: PreferenceMetadata {
            buyer_email: Some(input.buyer_email),
            course_ids,
            cart_id: Some(input.cart_id),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn line(currency: &str, price: rust_decimal::Decimal) -> cart_item::Model {
        cart_item::Model {
            id: Uuid::new_v4(),
            cart_id: Uuid::new_v4(),
            course_id: Uuid::new_v4(),
            title: "Fotografía desde cero".to_string(),
            unit_price: price,
            currency: currency.to_string(),
            quantity: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn input<'a>(
        items: &'a [cart_item::Model],
        cart_id: Uuid,
        locale: Option<&'a str>,
    ) -> AssembleInput<'a> {
        AssembleInput {
            cart_id,
            items,
            buyer_email: "ana@example.com".to_string(),
            checkout_currency: "ARS",
            public_base_url: "https://courses.example.com",
            locale,
        }
    }

    #[test]
    fn foreign_currency_lines_never_reach_the_gateway_request() {
        let items = vec![line("ARS", dec!(1000)), line("USD", dec!(25))];
        let cart_id = Uuid::new_v4();

        let request = assemble_request(input(&items, cart_id, None)).unwrap();

        assert_eq!(request.items.len(), 1);
        assert_eq!(request.items[0].currency_id, "ARS");
        assert_eq!(request.items[0].unit_price, dec!(1000));
        assert_eq!(request.metadata.course_ids, vec![items[0].course_id]);
    }

    #[test]
    fn cart_with_only_foreign_lines_is_empty_for_checkout() {
        let items = vec![line("USD", dec!(25))];

        let err = assemble_request(input(&items, Uuid::new_v4(), None)).unwrap_err();
        assert!(matches!(err, ServiceError::EmptyCart));
    }

    #[test]
    fn redirect_urls_embed_base_and_locale() {
        let items = vec![line("ARS", dec!(1000))];

        let request = assemble_request(input(&items, Uuid::new_v4(), Some("en"))).unwrap();

        assert_eq!(
            request.back_urls.success,
            "https://courses.example.com/en/checkout/success"
        );
        assert_eq!(
            request.back_urls.failure,
            "https://courses.example.com/en/checkout/failure"
        );
        assert_eq!(
            request.back_urls.pending,
            "https://courses.example.com/en/checkout/pending"
        );
        assert_eq!(
            request.notification_url,
            "https://courses.example.com/api/v1/payments/webhook"
        );
    }

    #[test]
    fn locale_defaults_when_absent_or_blank() {
        let items = vec![line("ARS", dec!(1000))];

        let request = assemble_request(input(&items, Uuid::new_v4(), Some("  "))).unwrap();
        assert!(request.back_urls.success.contains("/es/"));
    }

    #[test]
    fn preference_without_redirect_url_is_fatal() {
        use crate::gateway::CreatedPreference;

        let err = redirect_from(CreatedPreference {
            id: "pref-9".into(),
            init_point: None,
        })
        .unwrap_err();
        assert!(matches!(err, ServiceError::GatewayResponse(_)));

        let err = redirect_from(CreatedPreference {
            id: "pref-9".into(),
            init_point: Some(String::new()),
        })
        .unwrap_err();
        assert!(matches!(err, ServiceError::GatewayResponse(_)));

        let ok = redirect_from(CreatedPreference {
            id: "pref-9".into(),
            init_point: Some("https://gateway.test/redirect".into()),
        })
        .unwrap();
        assert_eq!(ok.url, "https://gateway.test/redirect");
        assert_eq!(ok.preference_id, "pref-9");
    }

    #[test]
    fn metadata_carries_buyer_email_and_cart_id() {
        let items = vec![line("ARS", dec!(1000))];
        let cart_id = Uuid::new_v4();

        let request = assemble_request(input(&items, cart_id, None)).unwrap();

        assert_eq!(request.metadata.buyer_email.as_deref(), Some("ana@example.com"));
        assert_eq!(request.metadata.cart_id, Some(cart_id));
        assert_eq!(request.payer_email, "ana@example.com");
    }
}
