use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::{
    auth::AuthenticatedUser,
    entities::EntitlementModel,
    errors::ServiceError,
    AppState,
};

/// Routes exposing the entitlement read surface to the UI
pub fn entitlements_routes() -> Router<AppState> {
    Router::new().route("/", get(list_entitlements))
}

pub fn my_entitlements_routes() -> Router<AppState> {
    Router::new().route("/entitlements", get(my_entitlements))
}

/// Grants held by the logged-in buyer. Looked up by email: grants written
/// for a purchase made before the account existed are found here too.
#[utoipa::path(
    get,
    path = "/api/v1/me/entitlements",
    responses(
        (status = 200, description = "Courses the buyer can access"),
        (status = 401, description = "Missing or invalid token", body = crate::errors::ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "Entitlements"
)]
pub async fn my_entitlements(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
) -> Result<Json<Vec<EntitlementModel>>, ServiceError> {
    let grants = state
        .services
        .entitlements
        .grants_for(&identity.email)
        .await?;

    Ok(Json(grants))
}

#[derive(Debug, Deserialize)]
pub struct EntitlementsQuery {
    email: String,
}

/// Admin lookup of any buyer's grants
#[utoipa::path(
    get,
    path = "/api/v1/entitlements",
    params(("email" = String, Query, description = "Buyer email")),
    responses(
        (status = 200, description = "Grants for the buyer"),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "Entitlements"
)]
pub async fn list_entitlements(
    State(state): State<AppState>,
    AuthenticatedUser(identity): AuthenticatedUser,
    Query(query): Query<EntitlementsQuery>,
) -> Result<Json<Vec<EntitlementModel>>, ServiceError> {
    if !identity.is_admin() {
        return Err(ServiceError::Forbidden(
            "entitlement lookup is admin-only".to_string(),
        ));
    }

    let grants = state.services.entitlements.grants_for(&query.email).await?;
    Ok(Json(grants))
}
