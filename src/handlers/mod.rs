//! HTTP surface
//!
//! Everything is served under `/payments`:
//!
//! | Route | Handler |
//! |---|---|
//! | `GET /payments/health` | [`status::health_handler`] |
//! | `POST /payments/webhook` | [`crate::stripe::stripe_webhook_handler`] |
//! | `GET /payments/subscription/:user_id` | [`admin::get_subscription_handler`] |
//! | `GET /payments/invoices/:user_id` | [`admin::list_invoices_handler`] |
//! | `POST /payments/cancel/:user_id` | [`admin::cancel_handler`] |
//! | `POST /payments/reactivate/:user_id` | [`admin::reactivate_handler`] |

pub mod admin;
pub mod status;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::admin::SubscriptionAdmin;
use crate::stripe::handler::{stripe_webhook_router, WebhookState};

pub use admin::{admin_router, Tenant};
pub use status::{health_handler, status_router, HealthResponse};

/// Path prefix for every route
pub const BASE_PATH: &str = "/payments";

/// Full application router with request tracing
pub fn app_router(webhook: Arc<WebhookState>, admin: Arc<SubscriptionAdmin>) -> Router {
    let routes = Router::new()
        .merge(status_router())
        .merge(stripe_webhook_router(webhook))
        .merge(admin_router(admin));

    Router::new()
        .nest(BASE_PATH, routes)
        .layer(TraceLayer::new_for_http())
}
