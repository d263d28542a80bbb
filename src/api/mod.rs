//! API layer -- axum routes, handlers, and middleware.

pub mod envelope;
pub mod extract;
mod routes;
pub mod state;

use axum::http::{Request, StatusCode};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use self::envelope::ResultEnvelope;
use self::state::AppState;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request<_>| {
            tracing::info_span!(
                "http",
                request_id = %Uuid::new_v4(),
                method = %req.method(),
                uri = %req.uri(),
            )
        }))
        .with_state(state)
}

async fn fallback() -> (StatusCode, Json<ResultEnvelope<()>>) {
    (StatusCode::NOT_FOUND, Json(ResultEnvelope::error("not found")))
}
