//! Administrative HTTP endpoints
//!
//! ```text
//! GET  /subscription/:user_id   -> Subscription
//! GET  /invoices/:user_id       -> [Invoice]
//! POST /cancel/:user_id         -> {"status":"success","message":...}
//! POST /reactivate/:user_id     -> {"status":"success","message":...}
//! ```
//!
//! Every route is scoped by the `X-Tenant-ID` header. Authentication of the
//! caller is left to the layer in front of this service.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::admin::{AdminResult, SubscriptionAdmin};
use crate::error::ErrorResponse;
use crate::models::{Invoice, Subscription};

/// Header naming the tenant a request acts within
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Tenant taken from the `X-Tenant-ID` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant(pub String);

/// Rejection for a missing or empty tenant header
#[derive(Debug, Clone, Copy)]
pub struct MissingTenant;

impl IntoResponse for MissingTenant {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("X-Tenant-ID header is required")),
        )
            .into_response()
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = MissingTenant;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(TENANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Tenant(v.to_string()))
            .ok_or(MissingTenant)
    }
}

/// Body returned by cancel and reactivate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    /// Always "success"
    pub status: String,
    /// What happened
    pub message: String,
}

impl ActionResponse {
    fn success(message: &str) -> Self {
        Self {
            status: "success".to_string(),
            message: message.to_string(),
        }
    }
}

/// `GET /subscription/:user_id`
#[instrument(skip_all, fields(user_id = %user_id, tenant = %tenant))]
pub async fn get_subscription_handler(
    State(admin): State<Arc<SubscriptionAdmin>>,
    Tenant(tenant): Tenant,
    Path(user_id): Path<String>,
) -> AdminResult<Json<Subscription>> {
    admin.subscription(&user_id, &tenant).await.map(Json)
}

/// `GET /invoices/:user_id`
#[instrument(skip_all, fields(user_id = %user_id, tenant = %tenant))]
pub async fn list_invoices_handler(
    State(admin): State<Arc<SubscriptionAdmin>>,
    Tenant(tenant): Tenant,
    Path(user_id): Path<String>,
) -> AdminResult<Json<Vec<Invoice>>> {
    admin.invoices(&user_id, &tenant).await.map(Json)
}

/// `POST /cancel/:user_id`
#[instrument(skip_all, fields(user_id = %user_id, tenant = %tenant))]
pub async fn cancel_handler(
    State(admin): State<Arc<SubscriptionAdmin>>,
    Tenant(tenant): Tenant,
    Path(user_id): Path<String>,
) -> AdminResult<Json<ActionResponse>> {
    admin.cancel(&user_id, &tenant).await?;
    Ok(Json(ActionResponse::success(
        "Subscription scheduled for cancellation at period end",
    )))
}

/// `POST /reactivate/:user_id`
#[instrument(skip_all, fields(user_id = %user_id, tenant = %tenant))]
pub async fn reactivate_handler(
    State(admin): State<Arc<SubscriptionAdmin>>,
    Tenant(tenant): Tenant,
    Path(user_id): Path<String>,
) -> AdminResult<Json<ActionResponse>> {
    admin.reactivate(&user_id, &tenant).await?;
    Ok(Json(ActionResponse::success(
        "Subscription reactivated successfully",
    )))
}

/// Router with the administrative endpoints
pub fn admin_router(admin: Arc<SubscriptionAdmin>) -> Router {
    Router::new()
        .route("/subscription/:user_id", get(get_subscription_handler))
        .route("/invoices/:user_id", get(list_invoices_handler))
        .route("/cancel/:user_id", post(cancel_handler))
        .route("/reactivate/:user_id", post(reactivate_handler))
        .with_state(admin)
}
