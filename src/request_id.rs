//! Request-id propagation.
//!
//! Every request carries an id (inbound `x-request-id` or a generated one);
//! the id is scoped to the request's task so error bodies and log lines can
//! echo it without threading it through every signature.

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use std::future::Future;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone, Debug)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("req-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

tokio::task_local! {
    static CURRENT_REQUEST_ID: RequestId;
}

/// Returns the request id scoped to the current task, if any.
pub fn current_request_id() -> Option<RequestId> {
    CURRENT_REQUEST_ID.try_with(|rid| rid.clone()).ok()
}

/// Runs `fut` with `id` installed as the current request id.
pub async fn scope_request_id<F>(id: RequestId, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_REQUEST_ID.scope(id, fut).await
}

/// Middleware: ensure every request carries an id and echo it on the response.
pub async fn request_id_middleware(request: Request<Body>, next: Next) -> Response {
    let rid = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(RequestId::new)
        .unwrap_or_else(RequestId::generate);

    let header_value = HeaderValue::from_str(rid.as_str()).ok();

    let mut response = scope_request_id(rid, next.run(request)).await;

    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scoped_id_is_visible_inside_the_future() {
        let seen = scope_request_id(RequestId::new("req-scope-1"), async {
            current_request_id().map(|rid| rid.as_str().to_string())
        })
        .await;
        assert_eq!(seen.as_deref(), Some("req-scope-1"));
    }

    #[tokio::test]
    async fn no_id_outside_a_scope() {
        assert!(current_request_id().is_none());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(RequestId::generate().as_str(), RequestId::generate().as_str());
    }
}
