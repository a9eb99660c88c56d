//! Authentication for the storefront.
//!
//! Buyers log in with email + password and receive an HS256 JWT carrying
//! their identity. `GET /auth/me` verifies the bearer token; that call is
//! what the [`session::SessionCoordinator`] coalesces on the client side.
//! Entitlement attribution never uses this identity — only the
//! gateway-echoed email on the payment record.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use axum::{
    extract::{FromRequestParts, State},
    http::{header, request::Parts},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{user, User, UserRole},
    errors::ServiceError,
    AppState,
};

pub mod session;

pub use session::SessionCoordinator;

/// Claim structure for JWT tokens
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Subject (user ID)
    pub email: String,
    pub role: UserRole,
    pub iat: i64, // Issued at time
    pub exp: i64, // Expiration time
    pub iss: String, // Issuer
    pub aud: String, // Audience
}

/// The verified identity behind a bearer credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SessionIdentity {
    pub user_id: Uuid,
    pub email: String,
    pub role: UserRole,
}

impl SessionIdentity {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// Authentication configuration
#[derive(Clone)]
pub struct AuthConfig {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    token_ttl: Duration,
}

impl AuthConfig {
    pub fn new(
        jwt_secret: &str,
        issuer: String,
        audience: String,
        token_ttl: Duration,
    ) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            issuer,
            audience,
            token_ttl,
        }
    }
}

/// Login credentials
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

/// Issued bearer token plus the identity it proves
#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    pub token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub identity: SessionIdentity,
}

/// Issues and verifies bearer credentials against the users table.
pub struct AuthService {
    config: AuthConfig,
    db: Arc<DatabaseConnection>,
}

impl AuthService {
    pub fn new(config: AuthConfig, db: Arc<DatabaseConnection>) -> Self {
        Self { config, db }
    }

    /// Verifies credentials and issues a token. Unknown email and wrong
    /// password are indistinguishable to the caller.
    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, ServiceError> {
        let user = User::find()
            .filter(user::Column::Email.eq(request.email.as_str()))
            .one(&*self.db)
            .await?;

        let Some(user) = user else {
            debug!(email = %request.email, "login attempt for unknown email");
            return Err(ServiceError::AuthError("Invalid credentials".to_string()));
        };

        let parsed_hash = PasswordHash::new(&user.password_hash)
            .map_err(|e| ServiceError::InternalError(format!("stored hash: {}", e)))?;

        if Argon2::default()
            .verify_password(request.password.as_bytes(), &parsed_hash)
            .is_err()
        {
            debug!(email = %request.email, "login attempt with wrong password");
            return Err(ServiceError::AuthError("Invalid credentials".to_string()));
        }

        self.issue_token(&user)
    }

    /// Issues a signed token for a known user.
    pub fn issue_token(&self, user: &user::Model) -> Result<LoginResponse, ServiceError> {
        let now = Utc::now().timestamp();
        let expires_in = self.config.token_ttl.as_secs();

        let claims = Claims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            role: user.role,
            iat: now,
            exp: now + expires_in as i64,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.config.encoding_key)
            .map_err(|e| ServiceError::AuthError(format!("token encoding: {}", e)))?;

        Ok(LoginResponse {
            token,
            token_type: "Bearer".to_string(),
            expires_in,
            identity: SessionIdentity {
                user_id: user.id,
                email: user.email.clone(),
                role: user.role,
            },
        })
    }

    /// Decodes and validates a bearer token into the identity it carries.
    pub fn verify_token(&self, token: &str) -> Result<SessionIdentity, ServiceError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);

        let data = decode::<Claims>(token, &self.config.decoding_key, &validation)
            .map_err(|e| ServiceError::Unauthorized(format!("invalid token: {}", e)))?;

        let user_id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| ServiceError::Unauthorized("invalid token subject".to_string()))?;

        Ok(SessionIdentity {
            user_id,
            email: data.claims.email,
            role: data.claims.role,
        })
    }

    /// Hashes a password for storage. Used by account provisioning and
    /// test fixtures.
    pub fn hash_password(password: &str) -> Result<String, ServiceError> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ServiceError::InternalError(format!("hash: {}", e)))
    }
}

/// Extractor for handlers that require a logged-in buyer.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub SessionIdentity);

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ServiceError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| ServiceError::Unauthorized("missing bearer token".to_string()))?;

        let identity = state.auth.verify_token(token)?;
        Ok(AuthenticatedUser(identity))
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Routes mounted at `/auth`
pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(login_handler))
        .route("/me", get(me_handler))
}

/// Issue a bearer token for valid credentials
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token issued", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = crate::errors::ErrorResponse)
    ),
    tag = "Auth"
)]
async fn login_handler(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ServiceError> {
    payload.validate()?;
    let response = state.auth.login(&payload).await?;
    Ok(Json(response))
}

/// Resolve the identity behind the bearer token
#[utoipa::path(
    get,
    path = "/auth/me",
    responses(
        (status = 200, description = "Current identity", body = SessionIdentity),
        (status = 401, description = "Missing or invalid token", body = crate::errors::ErrorResponse)
    ),
    security(("bearer" = [])),
    tag = "Auth"
)]
async fn me_handler(AuthenticatedUser(identity): AuthenticatedUser) -> Json<SessionIdentity> {
    Json(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AuthConfig {
        AuthConfig::new(
            "unit-test-secret-that-is-long-enough-for-hs256-token-signing-000000",
            "courseloft-api".into(),
            "courseloft-buyers".into(),
            Duration::from_secs(3600),
        )
    }

    fn test_user() -> user::Model {
        user::Model {
            id: Uuid::new_v4(),
            email: "ana@example.com".into(),
            password_hash: String::new(),
            role: UserRole::Buyer,
            created_at: Utc::now(),
        }
    }

    fn service() -> AuthService {
        AuthService::new(test_config(), Arc::new(DatabaseConnection::default()))
    }

    #[test]
    fn issued_token_round_trips_to_the_same_identity() {
        let svc = service();
        let user = test_user();

        let issued = svc.issue_token(&user).unwrap();
        let identity = svc.verify_token(&issued.token).unwrap();

        assert_eq!(identity.user_id, user.id);
        assert_eq!(identity.email, user.email);
        assert_eq!(identity.role, UserRole::Buyer);
        assert_eq!(issued.identity, identity);
    }

    #[test]
    fn garbage_token_is_rejected() {
        let svc = service();
        let err = svc.verify_token("not-a-jwt").unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let svc = service();
        let other = AuthService::new(
            AuthConfig::new(
                "a-completely-different-secret-also-long-enough-for-hs256-signing-11",
                "courseloft-api".into(),
                "courseloft-buyers".into(),
                Duration::from_secs(3600),
            ),
            Arc::new(DatabaseConnection::default()),
        );

        let issued = other.issue_token(&test_user()).unwrap();
        assert!(svc.verify_token(&issued.token).is_err());
    }

    #[test]
    fn token_for_other_audience_is_rejected() {
        let svc = service();
        let other = AuthService::new(
            AuthConfig::new(
                "unit-test-secret-that-is-long-enough-for-hs256-token-signing-000000",
                "courseloft-api".into(),
                "other-audience".into(),
                Duration::from_secs(3600),
            ),
            Arc::new(DatabaseConnection::default()),
        );

        let issued = other.issue_token(&test_user()).unwrap();
        assert!(svc.verify_token(&issued.token).is_err());
    }

    #[test]
    fn password_hashes_verify_and_differ_per_salt() {
        let first = AuthService::hash_password("hunter2hunter2").unwrap();
        let second = AuthService::hash_password("hunter2hunter2").unwrap();
        assert_ne!(first, second);

        let parsed = PasswordHash::new(&first).unwrap();
        assert!(Argon2::default()
            .verify_password(b"hunter2hunter2", &parsed)
            .is_ok());
        assert!(Argon2::default()
            .verify_password(b"wrong-password", &parsed)
            .is_err());
    }

    #[test]
    fn admin_flag_follows_role() {
        let mut identity = SessionIdentity {
            user_id: Uuid::new_v4(),
            email: "ops@example.com".into(),
            role: UserRole::Buyer,
        };
        assert!(!identity.is_admin());
        identity.role = UserRole::Admin;
        assert!(identity.is_admin());
    }
}
