use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use be_auth_core::{Claims, JwtConfig};

use crate::error::BillingError;

/// The authenticated profile making the request. `claims.sub` is the subject
/// that receives any purchased entitlement.
pub struct AuthUser(pub Claims);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = BillingError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let jwt_config = parts.extensions.get::<Arc<JwtConfig>>().ok_or_else(|| {
            BillingError::Internal(anyhow::anyhow!("JwtConfig not found in extensions"))
        })?;

        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                BillingError::Unauthorized("Missing authorization header".to_string())
            })?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            BillingError::Unauthorized(
                "Authorization header must start with 'Bearer '".to_string(),
            )
        })?;

        let claims = jwt_config
            .validate_access_token(token)
            .map_err(|e| BillingError::Unauthorized(e.to_string()))?;

        Ok(AuthUser(claims))
    }
}
