//! Bearer-token authentication middleware

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use subsync_shared::Permission;
use uuid::Uuid;

use super::jwt::{JwtError, JwtManager};
use crate::error::ApiError;

/// State needed by the auth middleware
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

/// Authenticated caller, inserted as a request extension
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub permissions: Vec<Permission>,
}

impl AuthUser {
    /// Fail with `Forbidden` unless one of the caller's permissions grants `needed`
    pub fn require(&self, needed: Permission) -> Result<(), ApiError> {
        if self.permissions.iter().any(|p| p.implies(needed)) {
            return Ok(());
        }
        tracing::warn!(
            user_id = %self.user_id,
            tenant_id = %self.tenant_id,
            permission = needed.as_str(),
            "Permission denied"
        );
        Err(ApiError::Forbidden)
    }
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Reject requests without a valid access token
pub async fn require_auth(
    State(auth): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&req).ok_or(ApiError::Unauthorized)?;

    let claims = auth.jwt_manager.validate_token(token).map_err(|e| {
        match &e {
            JwtError::Expired => tracing::debug!("Expired access token"),
            other => tracing::warn!(error = %other, "Rejected access token"),
        }
        ApiError::InvalidToken
    })?;

    req.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        tenant_id: claims.tenant_id,
        permissions: claims.permissions,
    });

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(permissions: Vec<Permission>) -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            permissions,
        }
    }

    #[test]
    fn manage_grants_view() {
        let manager = user(vec![Permission::ManageBilling]);
        assert!(manager.require(Permission::ViewBilling).is_ok());
        assert!(manager.require(Permission::ManageBilling).is_ok());
    }

    #[test]
    fn view_does_not_grant_manage() {
        let viewer = user(vec![Permission::ViewBilling]);
        assert!(viewer.require(Permission::ViewBilling).is_ok());
        assert!(matches!(
            viewer.require(Permission::ManageBilling),
            Err(ApiError::Forbidden)
        ));
        assert!(user(vec![]).require(Permission::ViewBilling).is_err());
    }
}
