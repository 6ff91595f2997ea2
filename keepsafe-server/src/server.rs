//! Axum router setup.

use axum::routing::{get, post};
use axum::Router;
use keepsafe_core::TokenAuthority;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::handlers::accounts;
use crate::storage::Storage;

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub tokens: TokenAuthority,
}

pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/register", post(accounts::register))
        .route("/login", post(accounts::login))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.max_body_size))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
