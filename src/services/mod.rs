pub mod carts;
pub mod checkout;
pub mod entitlements;
pub mod payments;

pub use carts::CartService;
pub use checkout::PreferenceBuilder;
pub use entitlements::{EntitlementService, EntitlementStore, SeaOrmEntitlementStore};
pub use payments::PaymentWebhookService;
