use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

use crate::{
    errors::ServiceError,
    services::payments::{WebhookDisposition, WebhookNotification},
    AppState,
};

type HmacSha256 = Hmac<Sha256>;

/// POST /api/v1/payments/webhook
///
/// The gateway's asynchronous notification endpoint. Acknowledges with
/// `{"received":true}` and 2xx for everything it can parse: the gateway
/// treats non-2xx as "redeliver", so non-2xx is reserved for transport and
/// parse failures where a redelivery could actually succeed. Everything
/// else — unknown events, unresolvable ids, non-approved or broken
/// records — is logged and dropped, and actionable redeliveries stay safe
/// because granting is idempotent.
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Notification acknowledged"),
        (status = 400, description = "Unparseable payload", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    // Verify signature if configured
    if let Some(secret) = state.config.payment_webhook_secret.clone() {
        let tolerance = state.config.payment_webhook_tolerance_secs.unwrap_or(300);
        if !verify_signature(&headers, &body, &secret, tolerance) {
            warn!("Payment webhook signature verification failed");
            return Err(ServiceError::Unauthorized(
                "invalid webhook signature".to_string(),
            ));
        }
    }

    let notification: WebhookNotification = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))?;

    let disposition = state.services.payments.process(&notification).await?;

    if let WebhookDisposition::Granted {
        ref payment_id,
        cart_id: Some(cart_id),
        ref outcome,
        ..
    } = disposition
    {
        // Best effort: the purchase is confirmed, so the originating cart
        // is done. A failure here never turns into a webhook failure.
        if outcome.is_complete() {
            if let Err(err) = state.services.carts.mark_converted(cart_id).await {
                warn!(
                    payment_id = %payment_id,
                    cart_id = %cart_id,
                    error = %err,
                    "could not convert cart after confirmed payment"
                );
            }
        }
    }

    info!(disposition = ?disposition, "webhook processed");
    Ok(Json(json!({ "received": true })))
}

fn verify_signature(headers: &HeaderMap, payload: &Bytes, secret: &str, tolerance_secs: u64) -> bool {
    let (Some(ts), Some(sig)) = (headers.get("x-timestamp"), headers.get("x-signature")) else {
        return false;
    };
    let (Ok(ts), Ok(sig)) = (ts.to_str(), sig.to_str()) else {
        return false;
    };

    if let Ok(ts_i) = ts.parse::<i64>() {
        let now = chrono::Utc::now().timestamp();
        if (now - ts_i).unsigned_abs() > tolerance_secs {
            return false;
        }
    }

    let signed = format!("{}.{}", ts, std::str::from_utf8(payload).unwrap_or(""));
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(signed.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(&expected, sig)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
