//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, per-request trace-ID injection)
//! - Optional Swagger UI / OpenAPI spec endpoint (disable with `QUILL_ENABLE_SWAGGER=false`)
//! - Health route (always open)
//! - OpenAI-compatible `/v1` routes, also served unversioned at the root,
//!   plus Azure-style `/openai/deployments/{model}/...` routes; all of them
//!   require the API key when one is configured

pub mod doc;
mod health;
mod v1;

use std::sync::Arc;

use axum::{Router, middleware};
use tower::ServiceBuilder;
use utoipa_swagger_ui::SwaggerUi;

use crate::middleware::{auth, cors, trace};
use crate::state::AppState;

// ── Router builder ────────────────────────────────────────────────────────────

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .merge(v1::root_router())
        .nest("/v1", v1::router())
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_api_key,
        ));

    let mut app = Router::new().merge(health::router()).merge(api);

    if state.config.enable_swagger {
        let docs = doc::get_docs(state.config.api_key.is_some());
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", docs));
    }

    app
        // Outermost layers execute first on the way in.
        .layer(ServiceBuilder::new().layer(cors::cors_layer(&state)))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests;
