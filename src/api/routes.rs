use axum::{
    extract::DefaultBodyLimit,
    http::{Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::middleware::add_security_headers;
use super::response::ApiError;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Pages and client resources
    let pages = Router::new()
        .route("/", get(handlers::index))
        .route("/!/res/*name", get(handlers::resource))
        .layer(middleware::from_fn(add_security_headers))
        .layer(CompressionLayer::new());

    Router::new()
        .merge(pages)
        // Session
        .route("/!/token", get(handlers::token))
        .route("/!/login", post(handlers::login))
        .route("/!/logout", post(handlers::logout))
        .route("/!/adduser", post(handlers::add_user))
        // Live sync
        .route("/!/socket", get(handlers::socket))
        // Files
        .route("/!/dl/*path", get(handlers::download))
        .route("/!/file/*path", get(handlers::inline))
        .route("/!/type/*path", get(handlers::file_type))
        .route("/!/zip/*path", get(handlers::zip))
        .route("/$/:code", get(handlers::share_link))
        .route(
            "/!/upload",
            post(handlers::upload).layer(DefaultBodyLimit::disable()),
        )
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Unknown GETs go back to the start page, anything else is not found.
async fn fallback(method: Method) -> impl IntoResponse {
    if method == Method::GET || method == Method::HEAD {
        ApiError::RedirectHome.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}
