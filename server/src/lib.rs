//! Library crate backing the `h5gate` binary: HTTP handlers, error mapping,
//! and the shared application state they operate on. `main.rs` wires these
//! together with the engine singletons from `h5gate-core`.

pub mod api;
pub mod error;
pub mod types;

use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use types::AppContext;

/// Build the Axum router for every endpoint in the HTTP surface, wired to
/// `ctx`. Shared by the binary entry point and by integration tests so both
/// exercise the exact same route table and middleware stack.
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/files", get(api::list_files))
        .route("/files/refresh", post(api::refresh))
        .route("/files/{key}/children", get(api::children))
        .route("/files/{key}/meta", get(api::meta))
        .route("/files/{key}/preview", get(api::preview))
        .route("/files/{key}/data", get(api::data))
        .route("/files/{key}/export/csv", get(api::export_csv))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
