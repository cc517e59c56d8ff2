//! Axum application wiring.
//!
//! - `services.rs`: engine wiring (store, propagator, bus, registry, cache)
//! - `routes/`: HTTP and WebSocket handlers

use std::sync::Arc;

use axum::{Extension, Router, routing::get};

pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full router (public entrypoint used by `main.rs` and tests).
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .route("/ws", get(routes::ws::connect))
        .layer(Extension(services))
}
