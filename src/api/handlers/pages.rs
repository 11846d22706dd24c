use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;

use super::{create_session, session_cookie};
use crate::api::response::ApiError;
use crate::resources::{Resource, AUTH_PAGE, FIRST_RUN_PAGE, MAIN_PAGE};
use crate::AppState;

/// GET /
///
/// Serves the main page to authorized visitors, otherwise the login or
/// first-run page. Public servers hand cookieless visitors a session.
pub async fn index(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let mut jar = jar;
    let mut cookie = session_cookie(&jar);
    if state.config.public && cookie.is_none() {
        let fresh = create_session(&state, false)?;
        cookie = Some(fresh.value().to_string());
        jar = jar.add(fresh);
    }

    let page = if state.is_authorized(cookie.as_deref()) {
        if let Some(cookie) = cookie.as_deref() {
            if !state.config.public {
                state.db.touch_session(cookie, Utc::now())?;
            }
        }
        MAIN_PAGE
    } else if state.is_first_run() {
        FIRST_RUN_PAGE
    } else {
        AUTH_PAGE
    };

    let response = serve_resource(&state, page, &headers)?;
    Ok((jar, response).into_response())
}

/// GET /!/res/*name
pub async fn resource(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve_resource(&state, &name, &headers)
}

fn serve_resource(state: &AppState, name: &str, headers: &HeaderMap) -> Result<Response, ApiError> {
    let resource = state
        .resources
        .get(name)
        .ok_or(ApiError::Empty(StatusCode::NOT_FOUND))?;
    Ok(resource_response(&resource, headers))
}

/// HTML is always revalidated, everything else is answered with 304 when the
/// client already holds the current version.
fn resource_response(resource: &Resource, headers: &HeaderMap) -> Response {
    let content_type = if resource.mime.starts_with("text/") {
        format!("{}; charset=utf-8", resource.mime)
    } else {
        resource.mime.clone()
    };
    let content_type = HeaderValue::from_str(&content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));

    if resource.is_html() {
        return (
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            ],
            resource.data.clone(),
        )
            .into_response();
    }

    let etag = HeaderValue::from_str(&resource.etag)
        .unwrap_or_else(|_| HeaderValue::from_static("\"\""));
    let fresh = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|tag| tag.trim() == resource.etag));
    if fresh {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response();
    }

    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::ETAG, etag),
            (header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=0")),
        ],
        resource.data.clone(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::api::create_router;
    use crate::testutil::{create_user, test_state, write_client_file};

    async fn get(app: axum::Router, uri: &str, extra: Option<(&str, &str)>) -> Response {
        let mut request = Request::get(uri);
        if let Some((name, value)) = extra {
            request = request.header(name, value);
        }
        app.oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_index_serves_first_run_page() {
        let dir = tempfile::tempdir().unwrap();
        write_client_file(&dir, "firstrun.html", "<p>first</p>");
        let state = test_state(&dir);

        let response = get(create_router(state), "/", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::X_FRAME_OPTIONS], "DENY");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"<p>first</p>");
    }

    #[tokio::test]
    async fn test_index_serves_auth_page_without_session() {
        let dir = tempfile::tempdir().unwrap();
        write_client_file(&dir, "auth.html", "<p>login</p>");
        let state = test_state(&dir);
        create_user(&state, "admin", "pw", true);
        state.set_first_run(false);

        let response = get(create_router(state), "/", None).await;
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"<p>login</p>");
    }

    #[tokio::test]
    async fn test_resource_etag_revalidation() {
        let dir = tempfile::tempdir().unwrap();
        write_client_file(&dir, "app.js", "let a = 1;");
        let state = test_state(&dir);
        let app = create_router(state);

        let response = get(app.clone(), "/!/res/app.js", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::X_FRAME_OPTIONS).is_none());
        let etag = response.headers()[header::ETAG].to_str().unwrap().to_string();

        let response = get(app.clone(), "/!/res/app.js", Some(("if-none-match", &etag))).await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let response = get(app, "/!/res/missing.js", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
