use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use super::{CreatedPreference, PaymentGateway, PaymentRecord, PreferenceRequest};
use crate::errors::ServiceError;

/// HTTP client for the payment gateway REST API.
///
/// Every call carries the configured bearer access token and a bounded
/// timeout. Timeouts and 5xx responses get a single retry; anything beyond
/// that surfaces as `ServiceError::Gateway` to the caller.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client build: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        })
    }

    fn should_retry(result: &Result<reqwest::Response, reqwest::Error>) -> bool {
        match result {
            Ok(response) => response.status().is_server_error(),
            Err(err) => err.is_timeout() || err.is_connect(),
        }
    }

    /// Executes `send` with at most one retry. The budget is deliberately
    /// small: exceeding it must surface an error, not hang the checkout.
    async fn send_with_retry<F>(&self, send: F) -> Result<reqwest::Response, ServiceError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let first = send().send().await;
        let result = if Self::should_retry(&first) {
            warn!("Gateway call failed, retrying once");
            send().send().await
        } else {
            first
        };

        result.map_err(|e| ServiceError::Gateway(format!("gateway request failed: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(items = request.items.len()))]
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<CreatedPreference, ServiceError> {
        let url = format!("{}/checkout/preferences", self.base_url);

        let response = self
            .send_with_retry(|| {
                self.client
                    .post(&url)
                    .bearer_auth(&self.access_token)
                    .json(request)
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Gateway(format!(
                "preference creation returned {}: {}",
                status, body
            )));
        }

        let created: CreatedPreference = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayResponse(format!("preference body: {}", e)))?;

        debug!(preference_id = %created.id, "created gateway preference");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, payment_id: &str) -> Result<Option<PaymentRecord>, ServiceError> {
        let url = format!("{}/v1/payments/{}", self.base_url, payment_id);

        let response = self
            .send_with_retry(|| self.client.get(&url).bearer_auth(&self.access_token))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let record: PaymentRecord = response
                    .json()
                    .await
                    .map_err(|e| ServiceError::GatewayResponse(format!("payment body: {}", e)))?;
                Ok(Some(record))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ServiceError::Gateway(format!(
                    "payment lookup returned {}: {}",
                    status, body
                )))
            }
        }
    }
}
