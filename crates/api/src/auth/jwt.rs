//! JWT token generation and validation

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subsync_shared::Permission;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// JWT claims carried by access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: Uuid,
    /// Tenant the user acts for
    pub tenant_id: Uuid,
    /// Billing permissions granted within the tenant
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
}

/// JWT manager for token operations
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_token_expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, access_token_expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_token_expiry_hours,
        }
    }

    /// Issue an access token for `user_id` acting within `tenant_id`
    pub fn generate_access_token(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        permissions: &[Permission],
    ) -> Result<String, JwtError> {
        let now = OffsetDateTime::now_utc();
        let exp = now + Duration::hours(self.access_token_expiry_hours);

        let claims = Claims {
            sub: user_id,
            tenant_id,
            permissions: permissions.to_vec(),
            iat: now.unix_timestamp(),
            exp: exp.unix_timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))
    }

    /// Validate and decode a token. Only HS256 is accepted.
    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token encoding failed: {0}")]
    Encoding(String),
    #[error("Token validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-at-least-32-chars!";

    #[test]
    fn test_token_generation_and_validation() {
        let jwt = JwtManager::new(SECRET, 24);
        let user_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();

        let token = jwt
            .generate_access_token(user_id, tenant_id, &[Permission::ManageBilling])
            .expect("Failed to generate token");

        let claims = jwt.validate_token(&token).expect("Invalid token");
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.tenant_id, tenant_id);
        assert_eq!(claims.permissions, vec![Permission::ManageBilling]);
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = JwtManager::new(SECRET, -2);
        let token = jwt
            .generate_access_token(Uuid::new_v4(), Uuid::new_v4(), &[])
            .expect("Failed to generate token");

        assert!(matches!(jwt.validate_token(&token), Err(JwtError::Expired)));
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let issuer = JwtManager::new("another-secret-key-at-least-32-chars", 1);
        let token = issuer
            .generate_access_token(Uuid::new_v4(), Uuid::new_v4(), &[])
            .expect("Failed to generate token");

        let jwt = JwtManager::new(SECRET, 1);
        assert!(jwt.validate_token(&token).is_err());
    }
}
