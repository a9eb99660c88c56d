use axum::{
    extract::{Json, State},
    routing::post,
    Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    errors::ServiceError,
    services::checkout::{CheckoutIdentity, CheckoutRedirect},
    AppState,
};

/// Creates the router for checkout endpoints
pub fn checkout_routes() -> Router<AppState> {
    Router::new().route("/preference", post(create_preference))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePreferenceRequest {
    pub cart_id: Uuid,
    /// Locale tag used for the post-payment redirect URLs
    pub locale: Option<String>,
}

/// Create a payment preference for the cart and return the redirect URL.
///
/// Fails synchronously before any gateway call when the buyer has no email
/// or the cart has nothing purchasable in the checkout currency; the buyer
/// sees the error before ever being redirected to pay.
#[utoipa::path(
    post,
    path = "/api/v1/checkout/preference",
    request_body = CreatePreferenceRequest,
    responses(
        (status = 200, description = "Redirect URL created"),
        (status = 400, description = "Missing buyer email", body = crate::errors::ErrorResponse),
        (status = 422, description = "No purchasable items", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway failure", body = crate::errors::ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "Checkout"
)]
pub async fn create_preference(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Json(payload): Json<CreatePreferenceRequest>,
) -> Result<Json<CheckoutRedirect>, ServiceError> {
    let checkout_identity = CheckoutIdentity {
        user_id: identity.user_id,
        email: Some(identity.email),
    };

    let redirect = state
        .services
        .checkout
        .build_preference(
            payload.cart_id,
            &checkout_identity,
            payload.locale.as_deref(),
        )
        .await?;

    Ok(Json(redirect))
}
