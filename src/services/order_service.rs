use std::collections::HashMap;

use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseTransaction, EntityTrait, FromQueryResult,
    JoinType, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set,
    TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{
        AdminOrderLine, AdminOrderList, AdminOrderView, CreateOrderRequest, CustomerInfo,
        OrderItemRequest, OrderList, OrderWithItems, PayOrderRequest, UpdateOrderStatusRequest,
    },
    entity::{
        order_items::{
            ActiveModel as LineActive, Column as LineCol, Entity as OrderItems,
            Model as LineModel, Relation as LineRelation,
        },
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel},
        products::{Column as ProdCol, Entity as Products},
        users::Model as UserModel,
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin, ensure_self_or_admin},
    models::{Order, OrderLineItem, OrderStatus, PaymentStatus},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    state::AppState,
};

/// Create an order: validate and merge the requested lines, then reserve
/// stock inside a single transaction. The reservation moment is here;
/// payment never touches stock again.
pub async fn create_order(
    state: &AppState,
    user: &AuthUser,
    payload: CreateOrderRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let requested = normalize_line_items(&payload.items)?;

    let txn = state.orm.begin().await?;

    // Phase one: every line must pass before any stock moves.
    let mut priced: Vec<(Uuid, i32, i64)> = Vec::with_capacity(requested.len());
    for (product_id, quantity) in &requested {
        let product = Products::find_by_id(*product_id)
            .one(&txn)
            .await?
            .ok_or(AppError::NotFound)?;

        if product.stock == 0 || *quantity > product.stock {
            return Err(AppError::InsufficientStock(format!(
                "Insufficient stock for {}. Available: {}",
                product.name, product.stock
            )));
        }

        priced.push((*product_id, *quantity, product.price));
    }

    // Phase two: conditional decrements. The `stock >= quantity` guard in
    // the UPDATE itself closes the race between concurrent checkouts; a
    // zero-row update means someone else got there first, and dropping the
    // transaction rolls back every decrement already applied.
    for (product_id, quantity, _) in &priced {
        let result = Products::update_many()
            .col_expr(ProdCol::Stock, Expr::col(ProdCol::Stock).sub(*quantity))
            .filter(
                Condition::all()
                    .add(ProdCol::Id.eq(*product_id))
                    .add(ProdCol::Stock.gte(*quantity)),
            )
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            return Err(AppError::InsufficientStock(format!(
                "Insufficient stock for product {product_id}"
            )));
        }
    }

    let total_price = compute_total(&priced);
    let order_id = Uuid::new_v4();

    let order = OrderActive {
        id: Set(order_id),
        user_id: Set(user.user_id),
        total_price: Set(total_price),
        status: Set(OrderStatus::Pending.as_str().into()),
        payment_status: Set(PaymentStatus::Pending.as_str().into()),
        transaction_id: Set(None),
        payment_method: Set(None),
        refunded_at: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    let mut items: Vec<OrderLineItem> = Vec::with_capacity(priced.len());
    for (product_id, quantity, unit_price) in &priced {
        let line = LineActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(*product_id),
            quantity: Set(*quantity),
            unit_price: Set(*unit_price),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
        items.push(line_from_entity(line));
    }

    txn.commit().await?;

    audit(state, user, "order_create", &order.id).await;

    let order = order_from_entity(order)?;
    Ok(ApiResponse::success(
        "Order created",
        OrderWithItems { order, items },
        Some(Meta::empty()),
    ))
}

/// Simulate a payment. Stock was reserved at creation, so success only
/// records the transaction; a re-check or second decrement here would be a
/// double reservation.
pub async fn pay_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: PayOrderRequest,
) -> AppResult<ApiResponse<Order>> {
    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    ensure_self_or_admin(user, order.user_id)?;

    if parse_order_status(&order.status)? == OrderStatus::Cancelled {
        return Err(AppError::InvalidTransition(
            "a cancelled order cannot be paid".into(),
        ));
    }

    let current = parse_payment_status(&order.payment_status)?;
    if current == PaymentStatus::Succeeded {
        return Err(AppError::AlreadyPaid);
    }

    let next = if payload.fail_payment {
        PaymentStatus::Failed
    } else {
        PaymentStatus::Succeeded
    };
    // A repeated failing attempt may stay failed; everything else must be a
    // legal transition.
    if current != next && !current.can_transition_to(next) {
        return Err(AppError::InvalidTransition(format!(
            "payment cannot move from {} to {}",
            current.as_str(),
            next.as_str()
        )));
    }

    let mut active: OrderActive = order.into();
    active.payment_status = Set(next.as_str().into());
    if next == PaymentStatus::Succeeded {
        active.transaction_id = Set(Some(build_transaction_id()));
        active.payment_method = Set(Some(
            payload.payment_method.unwrap_or_else(|| "card".to_string()),
        ));
    }
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    txn.commit().await?;

    let action = match next {
        PaymentStatus::Succeeded => "order_paid",
        _ => "order_payment_failed",
    };
    audit(state, user, action, &order.id).await;

    let message = match next {
        PaymentStatus::Succeeded => "Payment simulated successfully",
        _ => "Payment failed",
    };
    Ok(ApiResponse::success(
        message,
        order_from_entity(order)?,
        Some(Meta::empty()),
    ))
}

/// Owner-side cancellation; only pending orders qualify. Restores the
/// reserved quantities and marks the order cancelled.
pub async fn cancel_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<Order>> {
    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;
    ensure_self_or_admin(user, order.user_id)?;

    let status = parse_order_status(&order.status)?;
    if status != OrderStatus::Pending {
        return Err(AppError::InvalidTransition(format!(
            "a {} order cannot be cancelled by its owner",
            status.as_str()
        )));
    }

    let snapshot = order_from_entity(order.clone())?;
    if snapshot.reservation_held() {
        restore_stock(&txn, order.id).await?;
    }

    let mut active: OrderActive = order.into();
    active.status = Set(OrderStatus::Cancelled.as_str().into());
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    txn.commit().await?;

    audit(state, user, "order_cancelled", &order.id).await;

    Ok(ApiResponse::success(
        "Order cancelled and stock restored",
        order_from_entity(order)?,
        Some(Meta::empty()),
    ))
}

/// Admin cancellation. A paid order is kept as a cancelled record; an
/// unpaid one is removed outright. Either way the reservation is released
/// at most once.
pub async fn delete_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(user)?;
    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    let snapshot = order_from_entity(order.clone())?;
    if snapshot.reservation_held() {
        restore_stock(&txn, order.id).await?;
    }

    // Once money has moved the row is kept, refunded or not.
    let was_paid = matches!(
        snapshot.payment_status,
        PaymentStatus::Succeeded | PaymentStatus::Refunded
    );
    if was_paid {
        let mut active: OrderActive = order.into();
        active.status = Set(OrderStatus::Cancelled.as_str().into());
        active.updated_at = Set(Utc::now().into());
        active.update(&txn).await?;
    } else {
        OrderItems::delete_many()
            .filter(LineCol::OrderId.eq(id))
            .exec(&txn)
            .await?;
        Orders::delete_by_id(id).exec(&txn).await?;
    }

    txn.commit().await?;

    audit(state, user, "order_deleted", &id).await;

    Ok(ApiResponse::success(
        "Order cancelled and stock restored",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

/// Refund a paid order: restore stock (unless a cancellation already did)
/// and stamp the refund. The succeeded-only precondition makes a second
/// refund impossible.
pub async fn refund_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<Order>> {
    ensure_admin(user)?;
    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    match parse_payment_status(&order.payment_status)? {
        PaymentStatus::Refunded => return Err(AppError::AlreadyRefunded),
        PaymentStatus::Succeeded => {}
        other => {
            return Err(AppError::InvalidTransition(format!(
                "only paid orders can be refunded, payment is {}",
                other.as_str()
            )));
        }
    }

    let snapshot = order_from_entity(order.clone())?;
    if snapshot.reservation_held() {
        restore_stock(&txn, order.id).await?;
    }

    let mut active: OrderActive = order.into();
    active.payment_status = Set(PaymentStatus::Refunded.as_str().into());
    active.refunded_at = Set(Some(Utc::now().into()));
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    txn.commit().await?;

    audit(state, user, "order_refunded", &order.id).await;

    Ok(ApiResponse::success(
        "Order refunded and stock restored",
        order_from_entity(order)?,
        Some(Meta::empty()),
    ))
}

/// Admin status update, validated against the lifecycle table. Moving to
/// cancelled goes through the same reservation-release path as deletion.
pub async fn update_order_status(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateOrderStatusRequest,
) -> AppResult<ApiResponse<Order>> {
    ensure_admin(user)?;
    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or(AppError::NotFound)?;

    let current = parse_order_status(&order.status)?;
    let next = payload.status;
    if !current.can_transition_to(next) {
        return Err(AppError::InvalidTransition(format!(
            "order cannot move from {} to {}",
            current.as_str(),
            next.as_str()
        )));
    }

    let snapshot = order_from_entity(order.clone())?;
    if next == OrderStatus::Cancelled && snapshot.reservation_held() {
        restore_stock(&txn, order.id).await?;
    }

    let mut active: OrderActive = order.into();
    active.status = Set(next.as_str().into());
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    txn.commit().await?;

    audit(state, user, "order_status_update", &order.id).await;

    Ok(ApiResponse::success(
        "Order status updated",
        order_from_entity(order)?,
        Some(Meta::empty()),
    ))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or(AppError::NotFound)?;
    ensure_self_or_admin(user, order.user_id)?;

    let items = OrderItems::find()
        .filter(LineCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(line_from_entity)
        .collect();

    Ok(ApiResponse::success(
        "Order found",
        OrderWithItems {
            order: order_from_entity(order)?,
            items,
        },
        Some(Meta::empty()),
    ))
}

pub async fn list_user_orders(
    state: &AppState,
    user: &AuthUser,
    target_user_id: Uuid,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    ensure_self_or_admin(user, target_user_id)?;
    let (page, limit, offset) = query.pagination().normalize();

    let mut condition = Condition::all().add(OrderCol::UserId.eq(target_user_id));
    if let Some(status) = query.status {
        condition = condition.add(OrderCol::Status.eq(status.as_str()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);
    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_from_entity)
        .collect::<AppResult<Vec<_>>>()?;

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Orders",
        OrderList { items: orders },
        Some(meta),
    ))
}

/// Admin listing, joined with customer name/email and product names for
/// display.
pub async fn list_all_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<AdminOrderList>> {
    ensure_admin(user)?;
    let (page, limit, offset) = query.pagination().normalize();

    let mut condition = Condition::all();
    if let Some(status) = query.status {
        condition = condition.add(OrderCol::Status.eq(status.as_str()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);
    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let rows: Vec<(OrderModel, Option<UserModel>)> = finder
        .find_also_related(crate::entity::Users)
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?;

    let order_ids: Vec<Uuid> = rows.iter().map(|(o, _)| o.id).collect();

    #[derive(Debug, FromQueryResult)]
    struct AdminLineRow {
        order_id: Uuid,
        product_id: Uuid,
        quantity: i32,
        unit_price: i64,
        product_name: Option<String>,
    }

    let mut lines_by_order: HashMap<Uuid, Vec<AdminOrderLine>> = HashMap::new();
    if !order_ids.is_empty() {
        let line_rows = OrderItems::find()
            .select_only()
            .column(LineCol::OrderId)
            .column(LineCol::ProductId)
            .column(LineCol::Quantity)
            .column(LineCol::UnitPrice)
            .column_as(ProdCol::Name, "product_name")
            .join(JoinType::LeftJoin, LineRelation::Products.def())
            .filter(LineCol::OrderId.is_in(order_ids))
            .into_model::<AdminLineRow>()
            .all(&state.orm)
            .await?;

        for row in line_rows {
            lines_by_order
                .entry(row.order_id)
                .or_default()
                .push(AdminOrderLine {
                    product_id: row.product_id,
                    product_name: row.product_name,
                    quantity: row.quantity,
                    unit_price: row.unit_price,
                });
        }
    }

    let mut items = Vec::with_capacity(rows.len());
    for (order, customer) in rows {
        let order = order_from_entity(order)?;
        let lines = lines_by_order.remove(&order.id).unwrap_or_default();
        items.push(AdminOrderView {
            customer: customer.map(|u| CustomerInfo {
                name: u.name,
                email: u.email,
            }),
            items: lines,
            order,
        });
    }

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Orders",
        AdminOrderList { items },
        Some(meta),
    ))
}

/// Return every reserved quantity of an order to the catalog.
async fn restore_stock(txn: &DatabaseTransaction, order_id: Uuid) -> AppResult<()> {
    let items = OrderItems::find()
        .filter(LineCol::OrderId.eq(order_id))
        .all(txn)
        .await?;

    for item in items {
        Products::update_many()
            .col_expr(ProdCol::Stock, Expr::col(ProdCol::Stock).add(item.quantity))
            .filter(ProdCol::Id.eq(item.product_id))
            .exec(txn)
            .await?;
    }

    Ok(())
}

/// Merge duplicate product lines and reject malformed requests before any
/// store access.
fn normalize_line_items(items: &[OrderItemRequest]) -> AppResult<Vec<(Uuid, i32)>> {
    if items.is_empty() {
        return Err(AppError::Validation("Order must contain at least one item".into()));
    }

    let mut merged: Vec<(Uuid, i32)> = Vec::new();
    for item in items {
        if item.quantity < 1 {
            return Err(AppError::Validation(format!(
                "Quantity for product {} must be at least 1",
                item.product_id
            )));
        }
        match merged.iter_mut().find(|(id, _)| *id == item.product_id) {
            Some((_, quantity)) => {
                *quantity = quantity.checked_add(item.quantity).ok_or_else(|| {
                    AppError::Validation("Quantity overflow".into())
                })?;
            }
            None => merged.push((item.product_id, item.quantity)),
        }
    }

    Ok(merged)
}

fn compute_total(lines: &[(Uuid, i32, i64)]) -> i64 {
    lines
        .iter()
        .map(|(_, quantity, unit_price)| i64::from(*quantity) * unit_price)
        .sum()
}

fn build_transaction_id() -> String {
    let suffix = Uuid::new_v4().to_string();
    format!("TXN-{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

fn parse_order_status(value: &str) -> AppResult<OrderStatus> {
    OrderStatus::parse(value)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown order status {value}")))
}

fn parse_payment_status(value: &str) -> AppResult<PaymentStatus> {
    PaymentStatus::parse(value)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("unknown payment status {value}")))
}

fn order_from_entity(model: OrderModel) -> AppResult<Order> {
    Ok(Order {
        id: model.id,
        user_id: model.user_id,
        total_price: model.total_price,
        status: parse_order_status(&model.status)?,
        payment_status: parse_payment_status(&model.payment_status)?,
        transaction_id: model.transaction_id,
        payment_method: model.payment_method,
        refunded_at: model.refunded_at.map(|dt| dt.with_timezone(&Utc)),
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    })
}

fn line_from_entity(model: LineModel) -> OrderLineItem {
    OrderLineItem {
        id: model.id,
        order_id: model.order_id,
        product_id: model.product_id,
        quantity: model.quantity,
        unit_price: model.unit_price,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

async fn audit(state: &AppState, user: &AuthUser, action: &str, order_id: &Uuid) {
    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        action,
        Some("orders"),
        Some(serde_json::json!({ "order_id": order_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(product_id: Uuid, quantity: i32) -> OrderItemRequest {
        OrderItemRequest {
            product_id,
            quantity,
        }
    }

    #[test]
    fn empty_order_is_rejected() {
        assert!(matches!(
            normalize_line_items(&[]),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let id = Uuid::new_v4();
        assert!(matches!(
            normalize_line_items(&[line(id, 0)]),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn duplicate_products_merge_quantities() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let merged =
            normalize_line_items(&[line(a, 2), line(b, 1), line(a, 3)]).expect("valid lines");
        assert_eq!(merged, vec![(a, 5), (b, 1)]);
    }

    #[test]
    fn total_is_sum_of_quantity_times_unit_price() {
        let lines = vec![
            (Uuid::new_v4(), 3, 4500),
            (Uuid::new_v4(), 1, 12000),
        ];
        assert_eq!(compute_total(&lines), 3 * 4500 + 12000);
    }

    #[test]
    fn transaction_ids_differ_per_attempt() {
        assert_ne!(build_transaction_id(), build_transaction_id());
    }
}
