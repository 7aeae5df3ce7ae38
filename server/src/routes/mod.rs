//! HTTP route definitions.

mod health;

use crate::handlers;
use crate::AppServices;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

/// Create all application routes: the plain health surface plus the one
/// WebSocket endpoint every anchor connection goes through.
pub fn create_routes() -> Router<Arc<AppServices>> {
    Router::new()
        .merge(health::routes())
        .route("/ws/:channel/:anchor_id", get(handlers::upgrade))
}
