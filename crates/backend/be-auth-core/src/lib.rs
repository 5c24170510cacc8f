use anyhow::{Context, Result, anyhow};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

/// Access token claims issued by the auth service.
///
/// `sub` is the id of the profile currently acting; billing treats it as an
/// opaque subject id and never interprets it.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub token_type: String,
}

#[derive(Clone)]
pub struct JwtConfig {
    pub access_token_decoding_key: DecodingKey,
    pub validation: Validation,
}

impl JwtConfig {
    /// Loads the EC public key the auth service signs access tokens with.
    pub fn from_env() -> Result<Self> {
        let access_public = std::env::var("JWT_ACCESS_PUBLIC_KEY")
            .context("JWT_ACCESS_PUBLIC_KEY must be set (PEM-encoded EC public key)")?;

        let access_token_decoding_key = DecodingKey::from_ec_pem(access_public.as_bytes())
            .context("JWT_ACCESS_PUBLIC_KEY is not a valid EC PEM key")?;

        Ok(Self {
            access_token_decoding_key,
            validation: Validation::new(Algorithm::ES256),
        })
    }

    /// Shared-secret variant used by local setups and tests.
    pub fn from_hmac_secret(secret: &[u8]) -> Self {
        Self {
            access_token_decoding_key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(token, &self.access_token_decoding_key, &self.validation)
            .map_err(|e| anyhow!("Invalid token: {}", e))?;

        if token_data.claims.token_type != "access" {
            return Err(anyhow!("Invalid token type: expected access token"));
        }

        Ok(token_data.claims)
    }
}
