/// API Routes definition

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::websocket;
use crate::core::VolumeService;

pub fn create_router(service: Arc<VolumeService>, enable_cors: bool) -> Router {
    let mut app = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/volumes", get(handlers::list_volumes))
        .route("/volumes/:name", delete(handlers::delete_volume))
        .route("/volumes/:name/size", get(handlers::volume_size))
        .route(
            "/volumes/:name/export",
            get(handlers::export_volume).post(handlers::export_volume),
        )
        .route(
            "/volumes/:name/import",
            get(handlers::import_volume).post(handlers::import_volume),
        )
        .route(
            "/volumes/:name/clone",
            get(handlers::clone_volume).post(handlers::clone_volume),
        )
        .route(
            "/volumes/:name/save",
            get(handlers::save_volume).post(handlers::save_volume),
        )
        .route(
            "/volumes/:name/load",
            get(handlers::load_volume).post(handlers::load_volume),
        )
        .route(
            "/volumes/:name/transfer",
            get(handlers::transfer_volume).post(handlers::transfer_volume),
        )
        .route("/volumes/:name/empty", post(handlers::empty_volume))
        .route("/volumes/:name/run", post(handlers::run_container))
        .route("/ws/events", get(websocket::ws_events_handler))
        .fallback(handlers::not_found)
        .with_state(service)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        app = app.layer(CorsLayer::permissive());
    }

    app
}
