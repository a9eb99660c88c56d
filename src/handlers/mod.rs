use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::{
    config::AppConfig,
    events::EventSender,
    gateway::PaymentGateway,
    services::{
        entitlements::SeaOrmEntitlementStore, CartService, EntitlementService, PaymentWebhookService,
        PreferenceBuilder,
    },
};

pub mod carts;
pub mod checkout;
pub mod common;
pub mod courses;
pub mod entitlements;
pub mod payment_webhooks;

/// Aggregated services used by the HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub checkout: Arc<PreferenceBuilder>,
    pub entitlements: Arc<EntitlementService>,
    pub payments: Arc<PaymentWebhookService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        config: Arc<AppConfig>,
    ) -> Self {
        let carts = Arc::new(CartService::new(db.clone(), event_sender.clone()));
        let entitlements = Arc::new(EntitlementService::new(
            Arc::new(SeaOrmEntitlementStore::new(db)),
            event_sender.clone(),
        ));
        let checkout = Arc::new(PreferenceBuilder::new(
            carts.clone(),
            gateway.clone(),
            event_sender.clone(),
            config,
        ));
        let payments = Arc::new(PaymentWebhookService::new(
            gateway,
            entitlements.clone(),
            event_sender,
        ));

        Self {
            carts,
            checkout,
            entitlements,
            payments,
        }
    }
}
