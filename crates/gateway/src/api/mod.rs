//! HTTP API surface.

pub mod responses;
pub mod tasks;
pub mod title;

use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/responses", post(responses::create_response))
        .route("/v1/title", post(title::generate_title))
        .route(
            "/periodic-tasks/internal/create",
            post(tasks::create_task),
        )
        .route("/periodic-tasks/internal/list", get(tasks::list_tasks))
        .route(
            "/periodic-tasks/internal/:id/update",
            patch(tasks::update_task),
        )
        .route(
            "/periodic-tasks/internal/:id/resume",
            post(tasks::resume_task),
        )
        .route("/periodic-tasks/due", get(tasks::due_tasks))
        .route("/healthz", get(|| async { "ok" }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
