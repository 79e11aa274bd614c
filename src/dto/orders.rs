use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{Order, OrderLineItem, OrderStatus};

/// One requested line. Client-supplied prices are deliberately absent: the
/// catalog is the only price authority.
#[derive(Debug, Deserialize, ToSchema)]
pub struct OrderItemRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItemRequest>,
}

#[derive(Debug, Deserialize, Default, ToSchema)]
pub struct PayOrderRequest {
    /// Force the simulated payment to fail.
    #[serde(default)]
    pub fail_payment: bool,
    pub payment_method: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderWithItems {
    pub order: Order,
    pub items: Vec<OrderLineItem>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderList {
    pub items: Vec<Order>,
}

/// Admin listing row, joined with customer and product display fields.
#[derive(Debug, Serialize, ToSchema)]
pub struct AdminOrderView {
    pub order: Order,
    pub customer: Option<CustomerInfo>,
    pub items: Vec<AdminOrderLine>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AdminOrderLine {
    pub product_id: Uuid,
    pub product_name: Option<String>,
    pub quantity: i32,
    pub unit_price: i64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AdminOrderList {
    pub items: Vec<AdminOrderView>,
}
