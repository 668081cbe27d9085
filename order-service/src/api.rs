use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::*;
use std::sync::Arc;
use store::{OrderStore, StockLedger};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::service::{OrderError, OrderLineRequest, OrderService};

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderService>,
    pub order_store: Arc<dyn OrderStore>,
    pub ledger: Arc<dyn StockLedger>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub customer_id: CustomerId,
    pub items: Vec<OrderLineRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineResponse {
    pub product_id: ProductId,
    pub quantity: i32,
    pub price: BigDecimal,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: OrderId,
    pub customer_id: CustomerId,
    pub order_date: DateTime<Utc>,
    pub status: OrderStatus,
    pub items: Vec<OrderLineResponse>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        Self {
            id: order.id,
            customer_id: order.customer_id,
            order_date: order.order_date,
            status: order.status,
            items: order
                .lines
                .into_iter()
                .map(|line| OrderLineResponse {
                    product_id: line.product_id,
                    quantity: line.quantity,
                    price: line.price,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductResponse {
    pub id: ProductId,
    pub name: String,
    pub sku: String,
    pub price: BigDecimal,
    pub stock: i32,
    pub version: i64,
}

impl From<Product> for ProductResponse {
    fn from(product: Product) -> Self {
        Self {
            id: product.id,
            name: product.name,
            sku: product.sku,
            price: product.price,
            stock: product.stock,
            version: product.version,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError(OrderError);

impl From<OrderError> for ApiError {
    fn from(e: OrderError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrderError::NotFound { .. } => StatusCode::NOT_FOUND,
            OrderError::InvalidRequest(_) | OrderError::InsufficientStock { .. } => StatusCode::BAD_REQUEST,
            OrderError::ConcurrencyExhausted { .. } => StatusCode::CONFLICT,
            OrderError::PublishFailure { .. } | OrderError::Store(_) => {
                error!("Order request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/products", get(list_products))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), ApiError> {
    match state.orders.create_order(request.customer_id, request.items).await {
        Ok(order) => Ok((StatusCode::CREATED, Json(order.into()))),
        // Committed; the outbox relay delivers the event later.
        Err(OrderError::PublishFailure { order, source }) => {
            warn!("Order {} created, event deferred to outbox: {}", order.id, source);
            Ok((StatusCode::CREATED, Json((*order).into())))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<OrderId>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = state
        .order_store
        .order(id)
        .await
        .map_err(OrderError::from)?
        .ok_or(OrderError::NotFound {
            entity: store::Entity::Order,
            id,
        })?;
    Ok(Json(order.into()))
}

pub async fn list_products(State(state): State<AppState>) -> Result<Json<Vec<ProductResponse>>, ApiError> {
    let products = state.ledger.products().await.map_err(OrderError::from)?;
    info!("Listing {} products", products.len());
    Ok(Json(products.into_iter().map(ProductResponse::from).collect()))
}

pub async fn health_check() -> &'static str {
    "OK"
}
