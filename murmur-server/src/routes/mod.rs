//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - Body-size limit sized to the configured upload cap
//! - Optional Swagger UI (disable with `MURMUR_ENABLE_SWAGGER=false`)
//! - Health, pool, and task routes

pub mod doc;
mod health;
mod pool;
mod tasks;

use axum::extract::DefaultBodyLimit;
use axum::{middleware, Router};
use tower::ServiceBuilder;
use utoipa_swagger_ui::SwaggerUi;

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: AppState) -> Router {
    let api_router = Router::new()
        .merge(health::router())
        .merge(pool::router())
        .merge(tasks::router());

    let mut app = Router::new().merge(api_router);

    // Enabled by default; turn off in production to avoid exposing the API
    // structure.
    if state.config.enable_swagger {
        app = app.merge(
            SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", doc::get_docs()),
        );
    }

    // Multipart submissions carry the whole bundle plus form overhead.
    let body_limit = state.config.max_upload_bytes() + 64 * 1024;

    app.layer(ServiceBuilder::new().layer(cors::cors_layer(&state.config)))
        .layer(middleware::from_fn(trace::trace_middleware))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
