//! HTTP ingestion façade.
//!
//! Thin request binding over the in-process [`crate::service::ImageService`];
//! the data root is additionally browsable under `/browse`.

pub mod error;
mod images;

use axum::Router;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/images", images::routes())
        .nest_service("/browse", ServeDir::new(&state.data_folder))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
