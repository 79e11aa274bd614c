use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        auth::{LoginResponse, RegisterRequest},
        orders::{AdminOrderList, AdminOrderView, OrderList, OrderWithItems},
        products::ProductList,
        users::UserList,
    },
    models::{Order, OrderLineItem, Product, User},
    response::{ApiResponse, Meta},
    routes::{auth, health, health::HealthData, orders, params, products, users},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        auth::register,
        auth::login,
        auth::forgot_password,
        auth::validate_reset_token,
        auth::reset_password,
        products::list_products,
        products::get_product,
        products::create_product,
        products::update_product,
        products::delete_product,
        orders::create_order,
        orders::list_all_orders,
        orders::list_user_orders,
        orders::get_order,
        orders::update_order_status,
        orders::cancel_order,
        orders::delete_order,
        orders::pay_order,
        orders::refund_order,
        users::list_users,
        users::create_user,
        users::get_user,
        users::update_user,
        users::delete_user,
    ),
    components(
        schemas(
            User,
            Product,
            Order,
            OrderLineItem,
            RegisterRequest,
            LoginResponse,
            ProductList,
            OrderList,
            OrderWithItems,
            AdminOrderView,
            AdminOrderList,
            UserList,
            params::Pagination,
            params::ProductQuery,
            params::OrderListQuery,
            Meta,
            HealthData,
            ApiResponse<HealthData>,
            ApiResponse<Product>,
            ApiResponse<ProductList>,
            ApiResponse<Order>,
            ApiResponse<OrderWithItems>,
            ApiResponse<OrderList>,
            ApiResponse<AdminOrderList>,
            ApiResponse<User>,
            ApiResponse<UserList>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Auth", description = "Authentication and password reset"),
        (name = "Products", description = "Catalog endpoints"),
        (name = "Orders", description = "Orders, payment and refunds"),
        (name = "Users", description = "Profile endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
