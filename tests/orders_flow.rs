use majestic_scent_api::{
    db::{create_orm_conn, create_pool, run_migrations},
    dto::orders::{CreateOrderRequest, OrderItemRequest, PayOrderRequest, UpdateOrderStatusRequest},
    entity::{
        Products,
        products::ActiveModel as ProductActive,
        users::ActiveModel as UserActive,
    },
    error::AppError,
    middleware::auth::AuthUser,
    models::{OrderStatus, PaymentStatus, UserRole},
    services::order_service,
    state::AppState,
};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use uuid::Uuid;

// Integration flows for the reservation workflow. Set TEST_DATABASE_URL or
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

// Fixtures get unique emails and product names so tests can run in
// parallel and be re-run against the same database.
async fn create_user(state: &AppState, role: UserRole, email: &str) -> anyhow::Result<AuthUser> {
    let email = format!("{}-{}", Uuid::new_v4(), email);
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        name: Set("Test User".into()),
        email: Set(email),
        password_hash: Set("dummy".into()),
        role: Set(role.as_str().into()),
        failed_login_attempts: Set(0),
        lockout_until: Set(None),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(AuthUser {
        user_id: user.id,
        role,
    })
}

async fn create_product(
    state: &AppState,
    name: &str,
    price: i64,
    stock: i32,
) -> anyhow::Result<Uuid> {
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(format!("{} {}", name, Uuid::new_v4())),
        brand: Set("Majestic Scent".into()),
        description: Set("A perfume for testing".into()),
        image: Set("/images/test.jpg".into()),
        category: Set("Mixte".into()),
        price: Set(price),
        stock: Set(stock),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(product.id)
}

async fn stock_of(state: &AppState, id: Uuid) -> anyhow::Result<i32> {
    let product = Products::find_by_id(id)
        .one(&state.orm)
        .await?
        .expect("product exists");
    Ok(product.stock)
}

fn order_request(lines: &[(Uuid, i32)]) -> CreateOrderRequest {
    CreateOrderRequest {
        items: lines
            .iter()
            .map(|(product_id, quantity)| OrderItemRequest {
                product_id: *product_id,
                quantity: *quantity,
            })
            .collect(),
    }
}

// Scenario from the reservation design: stock 5, order of 3 succeeds, a
// second order of 3 fails without touching stock, refund restores it.
#[tokio::test]
async fn reserve_pay_refund_flow() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let client = create_user(&state, UserRole::Client, "client@example.com").await?;
    let admin = create_user(&state, UserRole::Admin, "admin@example.com").await?;
    let product_id = create_product(&state, "Nuit Imperiale", 4500, 5).await?;

    let created = order_service::create_order(&state, &client, order_request(&[(product_id, 3)]))
        .await?
        .data
        .unwrap();
    assert_eq!(created.order.total_price, 3 * 4500);
    assert_eq!(created.order.status, OrderStatus::Pending);
    assert_eq!(created.order.payment_status, PaymentStatus::Pending);
    assert_eq!(stock_of(&state, product_id).await?, 2);

    // Second order wants more than what is left; nothing must change.
    let err = order_service::create_order(&state, &client, order_request(&[(product_id, 3)]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InsufficientStock(_)));
    assert_eq!(stock_of(&state, product_id).await?, 2);

    // Payment records the transaction but leaves stock alone: the
    // reservation already happened at creation.
    let paid = order_service::pay_order(
        &state,
        &client,
        created.order.id,
        PayOrderRequest::default(),
    )
    .await?
    .data
    .unwrap();
    assert_eq!(paid.payment_status, PaymentStatus::Succeeded);
    assert!(paid.transaction_id.is_some());
    assert_eq!(paid.payment_method.as_deref(), Some("card"));
    assert_eq!(stock_of(&state, product_id).await?, 2);

    let err = order_service::pay_order(
        &state,
        &client,
        created.order.id,
        PayOrderRequest::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::AlreadyPaid));

    let refunded = order_service::refund_order(&state, &admin, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(refunded.payment_status, PaymentStatus::Refunded);
    assert!(refunded.refunded_at.is_some());
    assert_eq!(stock_of(&state, product_id).await?, 5);

    // Refunding twice is rejected and must not restore stock again.
    let err = order_service::refund_order(&state, &admin, created.order.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AlreadyRefunded));
    assert_eq!(stock_of(&state, product_id).await?, 5);

    Ok(())
}

#[tokio::test]
async fn duplicate_lines_merge_and_partial_failures_leave_stock_alone() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let client = create_user(&state, UserRole::Client, "client2@example.com").await?;
    let plenty = create_product(&state, "Aube Doree", 9400, 50).await?;
    let scarce = create_product(&state, "Essence Premiere", 12900, 1).await?;

    // Same product twice merges into one line.
    let created =
        order_service::create_order(&state, &client, order_request(&[(plenty, 1), (plenty, 2)]))
            .await?
            .data
            .unwrap();
    assert_eq!(created.items.len(), 1);
    assert_eq!(created.items[0].quantity, 3);
    assert_eq!(stock_of(&state, plenty).await?, 47);

    // One failing line must leave every product untouched.
    let err = order_service::create_order(
        &state,
        &client,
        order_request(&[(plenty, 2), (scarce, 5)]),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InsufficientStock(_)));
    assert_eq!(stock_of(&state, plenty).await?, 47);
    assert_eq!(stock_of(&state, scarce).await?, 1);

    Ok(())
}

#[tokio::test]
async fn owner_cancellation_restores_stock_once() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let client = create_user(&state, UserRole::Client, "client3@example.com").await?;
    let admin = create_user(&state, UserRole::Admin, "admin3@example.com").await?;
    let product_id = create_product(&state, "Sillage Libre", 7600, 10).await?;

    let created = order_service::create_order(&state, &client, order_request(&[(product_id, 4)]))
        .await?
        .data
        .unwrap();
    assert_eq!(stock_of(&state, product_id).await?, 6);

    let cancelled = order_service::cancel_order(&state, &client, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(stock_of(&state, product_id).await?, 10);

    // A cancelled order cannot be cancelled again or deleted into a second
    // restore.
    let err = order_service::cancel_order(&state, &client, created.order.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    order_service::delete_order(&state, &admin, created.order.id).await?;
    assert_eq!(stock_of(&state, product_id).await?, 10);

    Ok(())
}

#[tokio::test]
async fn status_updates_follow_the_lifecycle() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let client = create_user(&state, UserRole::Client, "client4@example.com").await?;
    let admin = create_user(&state, UserRole::Admin, "admin4@example.com").await?;
    let product_id = create_product(&state, "Nuit Blanche", 8000, 10).await?;

    let created = order_service::create_order(&state, &client, order_request(&[(product_id, 2)]))
        .await?
        .data
        .unwrap();

    // pending -> delivered skips shipping and must be rejected.
    let err = order_service::update_order_status(
        &state,
        &admin,
        created.order.id,
        UpdateOrderStatusRequest {
            status: OrderStatus::Delivered,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let shipped = order_service::update_order_status(
        &state,
        &admin,
        created.order.id,
        UpdateOrderStatusRequest {
            status: OrderStatus::Shipped,
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(shipped.status, OrderStatus::Shipped);

    // A shipped order is out of the owner's hands.
    let err = order_service::cancel_order(&state, &client, created.order.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let delivered = order_service::update_order_status(
        &state,
        &admin,
        created.order.id,
        UpdateOrderStatusRequest {
            status: OrderStatus::Delivered,
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);

    Ok(())
}

#[tokio::test]
async fn refunded_order_survives_admin_deletion() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let client = create_user(&state, UserRole::Client, "client6@example.com").await?;
    let admin = create_user(&state, UserRole::Admin, "admin6@example.com").await?;
    let product_id = create_product(&state, "Ombre Royale", 8800, 5).await?;

    let created = order_service::create_order(&state, &client, order_request(&[(product_id, 2)]))
        .await?
        .data
        .unwrap();
    order_service::pay_order(&state, &client, created.order.id, PayOrderRequest::default()).await?;
    order_service::refund_order(&state, &admin, created.order.id).await?;
    assert_eq!(stock_of(&state, product_id).await?, 5);

    // Money moved through this order, so deletion keeps the row as a
    // cancelled record instead of removing it.
    order_service::delete_order(&state, &admin, created.order.id).await?;

    let kept = order_service::get_order(&state, &admin, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(kept.order.status, OrderStatus::Cancelled);
    assert_eq!(kept.order.payment_status, PaymentStatus::Refunded);
    assert!(kept.order.transaction_id.is_some());
    assert_eq!(stock_of(&state, product_id).await?, 5);

    Ok(())
}

#[tokio::test]
async fn cancelled_order_cannot_be_paid() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let client = create_user(&state, UserRole::Client, "client7@example.com").await?;
    let product_id = create_product(&state, "Vent du Soir", 6700, 5).await?;

    let created = order_service::create_order(&state, &client, order_request(&[(product_id, 1)]))
        .await?
        .data
        .unwrap();
    order_service::cancel_order(&state, &client, created.order.id).await?;
    assert_eq!(stock_of(&state, product_id).await?, 5);

    let err = order_service::pay_order(
        &state,
        &client,
        created.order.id,
        PayOrderRequest::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let unchanged = order_service::get_order(&state, &client, created.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(unchanged.order.payment_status, PaymentStatus::Pending);
    assert!(unchanged.order.transaction_id.is_none());

    Ok(())
}

#[tokio::test]
async fn strangers_cannot_see_or_pay_other_users_orders() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let owner = create_user(&state, UserRole::Client, "owner@example.com").await?;
    let stranger = create_user(&state, UserRole::Client, "stranger@example.com").await?;
    let admin = create_user(&state, UserRole::Admin, "admin5@example.com").await?;
    let product_id = create_product(&state, "Aube Claire", 5000, 10).await?;

    let created = order_service::create_order(&state, &owner, order_request(&[(product_id, 1)]))
        .await?
        .data
        .unwrap();

    let err = order_service::get_order(&state, &stranger, created.order.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden));

    let err = order_service::pay_order(
        &state,
        &stranger,
        created.order.id,
        PayOrderRequest::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Forbidden));

    // Admin can read anything; the owner can read their own.
    order_service::get_order(&state, &admin, created.order.id).await?;
    order_service::get_order(&state, &owner, created.order.id).await?;

    Ok(())
}

#[tokio::test]
async fn concurrent_orders_cannot_oversell_the_last_unit() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };

    let a = create_user(&state, UserRole::Client, "racer-a@example.com").await?;
    let b = create_user(&state, UserRole::Client, "racer-b@example.com").await?;
    let product_id = create_product(&state, "Derniere Goutte", 9900, 1).await?;

    let state_a = state.clone();
    let state_b = state.clone();
    let req_a = order_request(&[(product_id, 1)]);
    let req_b = order_request(&[(product_id, 1)]);

    let (res_a, res_b) = tokio::join!(
        order_service::create_order(&state_a, &a, req_a),
        order_service::create_order(&state_b, &b, req_b),
    );

    let successes = [&res_a, &res_b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one of two racing orders may win");

    for res in [res_a, res_b] {
        if let Err(err) = res {
            assert!(matches!(err, AppError::InsufficientStock(_)));
        }
    }
    assert_eq!(stock_of(&state, product_id).await?, 0);

    Ok(())
}
