use argon2::{
    Argon2, PasswordHasher,
    password_hash::{PasswordHash, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    db::DbPool,
    dto::auth::{
        Claims, ForgotPasswordRequest, LoginRequest, LoginResponse, RegisterRequest,
        ResetPasswordRequest,
    },
    error::{AppError, AppResult},
    models::{User, UserRole},
    notify,
    response::{ApiResponse, Meta},
};

const MAX_LOGIN_FAILURES: i32 = 5;
const LOCKOUT_MINUTES: i64 = 10;
const RESET_TOKEN_MINUTES: i64 = 15;
const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
    email: String,
    password_hash: String,
    role: String,
    failed_login_attempts: i32,
    lockout_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl UserRow {
    fn into_user(self) -> AppResult<User> {
        let role = UserRole::parse(&self.role)
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown role {}", self.role)))?;
        Ok(User {
            id: self.id,
            name: self.name,
            email: self.email,
            role,
            created_at: self.created_at,
        })
    }
}

pub async fn register_user(
    pool: &DbPool,
    payload: RegisterRequest,
) -> AppResult<ApiResponse<User>> {
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::Validation("Name is required".into()));
    }
    let email = normalize_email(&payload.email)?;
    validate_password(&payload.password)?;

    let role = match payload.role.as_deref() {
        None => UserRole::Client,
        Some(value) => UserRole::parse(value)
            .ok_or_else(|| AppError::Validation(format!("Unknown role {value}")))?,
    };

    let exist: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE email = $1")
        .bind(email.as_str())
        .fetch_optional(pool)
        .await?;
    if exist.is_some() {
        return Err(AppError::Conflict("Email is already taken".into()));
    }

    let password_hash = hash_password(&payload.password)?;
    let id = Uuid::new_v4();

    let row: UserRow = sqlx::query_as(
        r#"
        INSERT INTO users (id, name, email, password_hash, role)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(email.as_str())
    .bind(password_hash)
    .bind(role.as_str())
    .fetch_one(pool)
    .await?;

    if let Err(err) = log_audit(
        pool,
        Some(row.id),
        "user_register",
        Some("users"),
        Some(serde_json::json!({ "user_id": row.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success("User created", row.into_user()?, None))
}

pub async fn login_user(pool: &DbPool, payload: LoginRequest) -> AppResult<ApiResponse<LoginResponse>> {
    let email = normalize_email(&payload.email)?;

    let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE email = $1")
        .bind(email.as_str())
        .fetch_optional(pool)
        .await?;
    // Same message for unknown email and wrong password.
    let row = row.ok_or_else(|| AppError::Validation("Invalid email or password".into()))?;

    if let Some(until) = row.lockout_until {
        if until > Utc::now() {
            return Err(AppError::AccountLocked);
        }
    }

    let parsed_hash = PasswordHash::new(&row.password_hash)
        .map_err(|_| AppError::Internal(anyhow::anyhow!("Invalid password hash")))?;

    let argon2 = Argon2::default();
    if argon2
        .verify_password(payload.password.as_bytes(), &parsed_hash)
        .is_err()
    {
        record_login_failure(pool, &row).await?;
        return Err(AppError::Validation("Invalid email or password".into()));
    }

    if row.failed_login_attempts > 0 || row.lockout_until.is_some() {
        sqlx::query(
            "UPDATE users SET failed_login_attempts = 0, lockout_until = NULL WHERE id = $1",
        )
        .bind(row.id)
        .execute(pool)
        .await?;
    }

    let user_id = row.id;
    let user = row.into_user()?;
    let token = issue_token(&user)?;

    if let Err(err) = log_audit(
        pool,
        Some(user_id),
        "user_login",
        Some("users"),
        Some(serde_json::json!({ "user_id": user_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Logged in",
        LoginResponse { token, user },
        Some(Meta::empty()),
    ))
}

/// Always answers generically so the endpoint cannot be used to probe for
/// registered addresses.
pub async fn forgot_password(
    pool: &DbPool,
    payload: ForgotPasswordRequest,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let email = normalize_email(&payload.email)?;

    let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE email = $1")
        .bind(email.as_str())
        .fetch_optional(pool)
        .await?;

    if let Some((user_id,)) = row {
        let token = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + Duration::minutes(RESET_TOKEN_MINUTES);
        sqlx::query(
            r#"
            INSERT INTO password_reset_tokens (id, user_id, token, expires_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&token)
        .bind(expires_at)
        .execute(pool)
        .await?;

        notify::send_password_reset(email.as_str(), &token).await;
    }

    Ok(ApiResponse::success(
        "If the address is registered, a reset link has been sent",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

pub async fn validate_reset_token(
    pool: &DbPool,
    token: &str,
) -> AppResult<ApiResponse<serde_json::Value>> {
    lookup_reset_token(pool, token).await?;
    Ok(ApiResponse::success(
        "Token is valid",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

pub async fn reset_password(
    pool: &DbPool,
    payload: ResetPasswordRequest,
) -> AppResult<ApiResponse<serde_json::Value>> {
    validate_password(&payload.password)?;
    let user_id = consume_reset_token(pool, &payload.token).await?;

    let password_hash = hash_password(&payload.password)?;
    sqlx::query(
        "UPDATE users SET password_hash = $2, failed_login_attempts = 0, lockout_until = NULL WHERE id = $1",
    )
    .bind(user_id)
    .bind(password_hash)
    .execute(pool)
    .await?;

    if let Err(err) = log_audit(
        pool,
        Some(user_id),
        "password_reset",
        Some("users"),
        Some(serde_json::json!({ "user_id": user_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Password updated",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

async fn lookup_reset_token(pool: &DbPool, token: &str) -> AppResult<(Uuid, Uuid)> {
    let row: Option<(Uuid, Uuid, DateTime<Utc>, bool)> = sqlx::query_as(
        "SELECT id, user_id, expires_at, used FROM password_reset_tokens WHERE token = $1",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    match row {
        Some((id, user_id, expires_at, false)) if expires_at > Utc::now() => Ok((id, user_id)),
        _ => Err(AppError::Validation("Invalid or expired reset token".into())),
    }
}

/// Mark the token used and return its owner in one statement, so two
/// concurrent resets with the same token cannot both consume it.
async fn consume_reset_token(pool: &DbPool, token: &str) -> AppResult<Uuid> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        UPDATE password_reset_tokens
        SET used = TRUE
        WHERE token = $1 AND NOT used AND expires_at > now()
        RETURNING user_id
        "#,
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    row.map(|(user_id,)| user_id)
        .ok_or_else(|| AppError::Validation("Invalid or expired reset token".into()))
}

async fn record_login_failure(pool: &DbPool, row: &UserRow) -> AppResult<()> {
    let attempts = row.failed_login_attempts + 1;
    if attempts >= MAX_LOGIN_FAILURES {
        let until = Utc::now() + Duration::minutes(LOCKOUT_MINUTES);
        sqlx::query(
            "UPDATE users SET failed_login_attempts = 0, lockout_until = $2 WHERE id = $1",
        )
        .bind(row.id)
        .bind(until)
        .execute(pool)
        .await?;
        tracing::warn!(user_id = %row.id, "account locked after repeated login failures");
    } else {
        sqlx::query("UPDATE users SET failed_login_attempts = $2 WHERE id = $1")
            .bind(row.id)
            .bind(attempts)
            .execute(pool)
            .await?;
    }
    Ok(())
}

fn issue_token(user: &User) -> AppResult<String> {
    let secret = std::env::var("JWT_SECRET")
        .map_err(|_| AppError::Internal(anyhow::anyhow!("JWT_SECRET is not set")))?;

    let expiration = Utc::now()
        .checked_add_signed(Duration::days(7))
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Failed to set expiration")))?;

    let claims = Claims {
        sub: user.id.to_string(),
        role: user.role.as_str().to_string(),
        exp: expiration.timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(anyhow::anyhow!(e.to_string())))?;

    Ok(format!("Bearer {token}"))
}

pub(crate) fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e.to_string())))?
        .to_string();
    Ok(hash)
}

pub(crate) fn validate_password(password: &str) -> AppResult<()> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must contain at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Trim, lowercase and shape-check an email address.
pub(crate) fn normalize_email(email: &str) -> AppResult<String> {
    let email = email.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    };
    if !valid {
        return Err(AppError::Validation("Invalid email address".into()));
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_trimmed_and_lowercased() {
        assert_eq!(
            normalize_email("  Alice@Example.COM ").unwrap(),
            "alice@example.com"
        );
    }

    #[test]
    fn malformed_emails_are_rejected() {
        for bad in ["", "no-at-sign", "@example.com", "user@nodot", "user@.com"] {
            assert!(normalize_email(bad).is_err(), "{bad} should be invalid");
        }
    }

    #[test]
    fn short_passwords_are_rejected() {
        assert!(validate_password("12345").is_err());
        assert!(validate_password("123456").is_ok());
    }
}
