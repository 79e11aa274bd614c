use axum::{extract::FromRequestParts, http::header};
use jsonwebtoken::{DecodingKey, Validation, decode};
use uuid::Uuid;

use crate::{dto::auth::Claims, error::AppError, models::UserRole};

/// Authenticated principal extracted from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: UserRole,
}

pub fn ensure_admin(user: &AuthUser) -> Result<(), AppError> {
    if user.role != UserRole::Admin {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

/// Capability check for owned resources: the owner may act on their own
/// record, admins may act on anyone's.
pub fn ensure_self_or_admin(user: &AuthUser, owner_id: Uuid) -> Result<(), AppError> {
    if user.user_id == owner_id || user.role == UserRole::Admin {
        return Ok(());
    }
    Err(AppError::Forbidden)
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;
    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or_else(|| AppError::Validation("Missing Authorization header".into()))?;

        let auth_str = auth_header
            .to_str()
            .map_err(|_| AppError::Validation("Invalid Authorization header".into()))?;

        if !auth_str.starts_with("Bearer ") {
            return Err(AppError::Validation("Invalid Authorization scheme".into()));
        }
        let token = auth_str.trim_start_matches("Bearer ").trim();

        let secret = std::env::var("JWT_SECRET")
            .map_err(|_| AppError::Internal(anyhow::anyhow!("JWT_SECRET is not set")))?;

        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AppError::Validation("Invalid or expired token".into()))?;

        let user_id = Uuid::parse_str(&decoded.claims.sub)
            .map_err(|_| AppError::Validation("Invalid user id in token".into()))?;

        let role = UserRole::parse(&decoded.claims.role)
            .ok_or_else(|| AppError::Validation("Invalid role in token".into()))?;

        Ok(AuthUser { user_id, role })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(role: UserRole) -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
            role,
        }
    }

    #[test]
    fn admin_passes_admin_check() {
        assert!(ensure_admin(&principal(UserRole::Admin)).is_ok());
        assert!(matches!(
            ensure_admin(&principal(UserRole::Client)),
            Err(AppError::Forbidden)
        ));
    }

    #[test]
    fn owner_may_access_own_resource() {
        let user = principal(UserRole::Client);
        assert!(ensure_self_or_admin(&user, user.user_id).is_ok());
    }

    #[test]
    fn admin_may_access_any_resource() {
        let admin = principal(UserRole::Admin);
        assert!(ensure_self_or_admin(&admin, Uuid::new_v4()).is_ok());
    }

    #[test]
    fn stranger_is_forbidden() {
        let user = principal(UserRole::Client);
        assert!(matches!(
            ensure_self_or_admin(&user, Uuid::new_v4()),
            Err(AppError::Forbidden)
        ));
    }
}
