use crate::handlers::common::{
    created_response, map_service_error, no_content_response, success_response, validate_input,
};
use crate::{
    errors::ApiError,
    services::carts::{AddToCartInput, CreateCartInput},
    AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_cart))
        .route("/{id}", get(get_cart))
        .route("/{id}/items", post(add_to_cart))
        .route("/{id}/items/{item_id}", put(update_cart_item))
        .route("/{id}/items/{item_id}", delete(remove_cart_item))
        .route("/{id}/clear", post(clear_cart))
        .route("/{id}/totals", get(cart_totals))
}

/// Create a new cart
async fn create_cart(
    State(state): State<AppState>,
    Json(payload): Json<CreateCartRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let input = CreateCartInput {
        session_id: payload.session_id,
        user_id: payload.user_id,
    };

    let cart = state
        .services
        .carts
        .create_cart(input)
        .await
        .map_err(map_service_error)?;

    Ok(created_response(cart))
}

/// Get cart with items
async fn get_cart(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let cart_with_items = state
        .services
        .carts
        .get_cart(id)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart_with_items))
}

/// Add a course to the cart
async fn add_to_cart(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    validate_input(&payload)?;

    let input = AddToCartInput {
        course_id: payload.course_id,
        quantity: payload.quantity,
    };

    let cart = state
        .services
        .carts
        .add_item(cart_id, input)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Update cart line quantity (zero removes the line)
async fn update_cart_item(
    State(state): State<AppState>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateItemRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .update_item_quantity(cart_id, item_id, payload.quantity)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(cart))
}

/// Remove a cart line
async fn remove_cart_item(
    State(state): State<AppState>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    state
        .services
        .carts
        .remove_item(cart_id, item_id)
        .await
        .map_err(map_service_error)?;

    Ok(no_content_response())
}

/// Empty the cart
async fn clear_cart(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    state
        .services
        .carts
        .clear_cart(id)
        .await
        .map_err(map_service_error)?;

    Ok(no_content_response())
}

/// Checkout totals for the cart, with other-currency lines listed as
/// excluded so the buyer is never silently over- or under-charged.
async fn cart_totals(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TotalsQuery>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let currency = query
        .currency
        .unwrap_or_else(|| state.config.checkout_currency.clone());

    let totals = state
        .services
        .carts
        .totals(id, &currency)
        .await
        .map_err(map_service_error)?;

    Ok(success_response(totals))
}

#[derive(Debug, Deserialize)]
struct CreateCartRequest {
    session_id: Option<String>,
    user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
struct AddItemRequest {
    course_id: Uuid,
    #[serde(default = "default_quantity")]
    #[validate(range(min = 1, max = 99))]
    quantity: i32,
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Deserialize)]
struct UpdateItemRequest {
    quantity: i32,
}

#[derive(Debug, Deserialize)]
struct TotalsQuery {
    currency: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_item_request_defaults_quantity() {
        let json = r#"{"course_id": "550e8400-e29b-41d4-a716-446655440000"}"#;
        let request: AddItemRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.quantity, 1);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn add_item_request_rejects_zero_quantity() {
        let json = r#"{"course_id": "550e8400-e29b-41d4-a716-446655440000", "quantity": 0}"#;
        let request: AddItemRequest = serde_json::from_str(json).unwrap();
        assert!(request.validate().is_err());
    }
}
