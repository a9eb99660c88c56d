use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Courseloft API",
        version = "0.3.1",
        description = r#"
# Courseloft Storefront API

Backend for a storefront selling access to video courses.

Buyers assemble a cart, start a checkout, and are redirected to the payment
gateway. Access to the purchased courses is granted only after the gateway
confirms the payment asynchronously through the webhook endpoint; webhook
notifications are verified against the gateway's own payment records before
any entitlement is written, and granting is idempotent under redelivery.

## Authentication

Buyer endpoints require a bearer token issued by `POST /auth/login`:

```
Authorization: Bearer <token>
```

The webhook endpoint is unauthenticated (optionally HMAC-signed) because it
is called by the gateway, not by buyers.
"#,
        contact(name = "Courseloft", email = "dev@courseloft.io")
    ),
    paths(
        crate::handlers::checkout::create_preference,
        crate::handlers::payment_webhooks::payment_webhook,
        crate::handlers::courses::list_courses,
        crate::handlers::courses::get_course,
        crate::handlers::entitlements::my_entitlements,
        crate::handlers::entitlements::list_entitlements,
    ),
    components(schemas(
        crate::errors::ErrorResponse,
        crate::auth::SessionIdentity,
        crate::auth::LoginRequest,
        crate::auth::LoginResponse,
        crate::handlers::checkout::CreatePreferenceRequest,
    )),
    tags(
        (name = "Checkout", description = "Cart to gateway-preference conversion"),
        (name = "Payments", description = "Gateway webhook ingestion"),
        (name = "Courses", description = "Course catalog"),
        (name = "Entitlements", description = "Course access grants"),
        (name = "Auth", description = "Identity issuance and verification"),
    )
)]
pub struct ApiDoc;

/// Swagger UI mounted at /swagger-ui, serving the generated document
pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi())
}
