use majestic_scent_api::{
    db::{create_orm_conn, create_pool, run_migrations},
    dto::auth::{ForgotPasswordRequest, RegisterRequest, ResetPasswordRequest},
    error::AppError,
    services::auth_service,
    state::AppState,
};
use uuid::Uuid;

// Password-reset flow against a live database. Set TEST_DATABASE_URL or
// DATABASE_URL to run; tests are skipped otherwise, as in CI without Postgres.
async fn setup_state() -> anyhow::Result<Option<AppState>> {
    let database_url =
        match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
                );
                return Ok(None);
            }
        };

    let pool = create_pool(&database_url).await?;
    let orm = create_orm_conn(&database_url).await?;
    run_migrations(&orm).await?;

    Ok(Some(AppState { pool, orm }))
}

async fn latest_reset_token(state: &AppState, user_id: Uuid) -> anyhow::Result<String> {
    let (token,): (String,) = sqlx::query_as(
        "SELECT token FROM password_reset_tokens WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(user_id)
    .fetch_one(&state.pool)
    .await?;
    Ok(token)
}

#[tokio::test]
async fn reset_token_is_single_use() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let email = format!("{}-reset@example.com", Uuid::new_v4());
    let user = auth_service::register_user(
        &state.pool,
        RegisterRequest {
            name: "Reset Tester".into(),
            email: email.clone(),
            password: "original-password".into(),
            role: None,
        },
    )
    .await?
    .data
    .unwrap();

    auth_service::forgot_password(&state.pool, ForgotPasswordRequest { email }).await?;
    let token = latest_reset_token(&state, user.id).await?;

    auth_service::validate_reset_token(&state.pool, &token).await?;

    let (hash_before,): (String,) =
        sqlx::query_as("SELECT password_hash FROM users WHERE id = $1")
            .bind(user.id)
            .fetch_one(&state.pool)
            .await?;

    auth_service::reset_password(
        &state.pool,
        ResetPasswordRequest {
            token: token.clone(),
            password: "brand-new-password".into(),
        },
    )
    .await?;

    let (hash_after,): (String,) =
        sqlx::query_as("SELECT password_hash FROM users WHERE id = $1")
            .bind(user.id)
            .fetch_one(&state.pool)
            .await?;
    assert_ne!(hash_before, hash_after);

    // The token was consumed; replaying it must fail and leave the new
    // password in place.
    let err = auth_service::reset_password(
        &state.pool,
        ResetPasswordRequest {
            token: token.clone(),
            password: "attacker-password".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = auth_service::validate_reset_token(&state.pool, &token)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let (hash_final,): (String,) =
        sqlx::query_as("SELECT password_hash FROM users WHERE id = $1")
            .bind(user.id)
            .fetch_one(&state.pool)
            .await?;
    assert_eq!(hash_after, hash_final);

    Ok(())
}

#[tokio::test]
async fn concurrent_resets_consume_the_token_once() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let email = format!("{}-race@example.com", Uuid::new_v4());
    let user = auth_service::register_user(
        &state.pool,
        RegisterRequest {
            name: "Race Tester".into(),
            email: email.clone(),
            password: "original-password".into(),
            role: None,
        },
    )
    .await?
    .data
    .unwrap();

    auth_service::forgot_password(&state.pool, ForgotPasswordRequest { email }).await?;
    let token = latest_reset_token(&state, user.id).await?;

    let (res_a, res_b) = tokio::join!(
        auth_service::reset_password(
            &state.pool,
            ResetPasswordRequest {
                token: token.clone(),
                password: "password-one".into(),
            },
        ),
        auth_service::reset_password(
            &state.pool,
            ResetPasswordRequest {
                token: token.clone(),
                password: "password-two".into(),
            },
        ),
    );

    let successes = [&res_a, &res_b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one of two racing resets may win");

    for res in [res_a, res_b] {
        if let Err(err) = res {
            assert!(matches!(err, AppError::Validation(_)));
        }
    }

    Ok(())
}
