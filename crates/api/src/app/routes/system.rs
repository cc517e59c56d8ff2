use std::sync::Arc;

use axum::{Json, extract::Extension, response::IntoResponse};

use crate::app::services::AppServices;

/// Liveness plus a few gauges.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": services.transport.connection_count(),
        "subscriptions": services.registry.subscription_count(),
    }))
}
