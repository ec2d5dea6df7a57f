use super::handlers;
use super::state::AppState;
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Call control
        .route("/call/status", get(handlers::call_status))
        .route("/call/join", post(handlers::join_call))
        .route("/call/leave", post(handlers::leave_call))
        .route("/call/chat", post(handlers::send_chat))
        // Local media
        .route("/call/media/toggle", post(handlers::toggle_media))
        .route("/call/media/switch", post(handlers::switch_device))
        // Recording control
        .route("/call/recording/start", post(handlers::start_recording))
        .route("/call/recording/pause", post(handlers::pause_recording))
        .route("/call/recording/resume", post(handlers::resume_recording))
        .route("/call/recording/stop", post(handlers::stop_recording))
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS for a browser UI served from `origins`; None when the list is empty
pub fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    if allowed.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(allowed)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE]),
    )
}
