use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use tracing::info;

use super::{create_session, expired_session_cookie, session_cookie};
use crate::api::response::{ApiError, AppJson};
use crate::auth::{hash_password, verify_password};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// POST /!/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    jar: CookieJar,
    AppJson(credentials): AppJson<Credentials>,
) -> Result<Response, ApiError> {
    if !state.login_limiter.try_acquire(addr.ip()) {
        return Err(ApiError::too_many_requests());
    }

    let user = state.db.get_user(&credentials.username)?;
    let verified = match user {
        Some(user) => {
            let privileged = user.privileged;
            let password = credentials.password.clone();
            let ok = tokio::task::spawn_blocking(move || verify_password(&user, &password))
                .await
                .map_err(|e| ApiError::internal(format!("Password check failed: {e}")))?;
            ok.then_some(privileged)
        }
        None => None,
    };

    match verified {
        Some(privileged) => {
            let cookie = create_session(&state, privileged)?;
            info!(user = %credentials.username, %addr, "User authenticated");
            Ok((jar.add(cookie), plain_status(StatusCode::OK)).into_response())
        }
        None => {
            info!(user = %credentials.username, %addr, "User unauthorized");
            Ok(plain_status(StatusCode::UNAUTHORIZED).into_response())
        }
    }
}

/// POST /!/logout
pub async fn logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> Result<Response, ApiError> {
    if let Some(cookie) = session_cookie(&jar) {
        state.db.delete_session(&cookie)?;
    }
    Ok((jar.remove(expired_session_cookie()), StatusCode::OK).into_response())
}

/// POST /!/adduser, only while no user exists
pub async fn add_user(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    AppJson(credentials): AppJson<Credentials>,
) -> Result<Response, ApiError> {
    if !state.is_first_run() {
        return Err(ApiError::Empty(StatusCode::NOT_FOUND));
    }
    if credentials.username.is_empty() || credentials.password.is_empty() {
        info!(user = %credentials.username, "Invalid user creation request");
        return Ok(plain_status(StatusCode::UNAUTHORIZED).into_response());
    }

    let rng = state.rng.clone();
    let password = credentials.password.clone();
    let record = tokio::task::spawn_blocking(move || hash_password(&rng, &password, true))
        .await
        .map_err(|e| ApiError::internal(format!("Password hashing failed: {e}")))?
        .map_err(|_| ApiError::internal("Password hashing failed"))?;
    state.db.put_user(&credentials.username, &record)?;

    let cookie = create_session(&state, true)?;
    state.set_first_run(false);
    info!(user = %credentials.username, "User added");
    Ok((jar.add(cookie), plain_status(StatusCode::OK)).into_response())
}

/// GET /!/token issues a CSRF token for socket frames.
pub async fn token(State(state): State<Arc<AppState>>, jar: CookieJar) -> Result<Response, ApiError> {
    if !state.is_authorized(session_cookie(&jar).as_deref()) {
        return Err(ApiError::unauthorized());
    }
    let token = state
        .csrf
        .issue()
        .map_err(|_| ApiError::internal("Failed to generate token"))?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain"),
            (header::EXPIRES, "0"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        token,
    )
        .into_response())
}

fn plain_status(status: StatusCode) -> impl IntoResponse {
    (status, [(header::CONTENT_TYPE, "text/plain")])
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::api::create_router;
    use crate::testutil::{create_user, test_state};

    fn login_request(user: &str, pass: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/!/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(
                r#"{{"username":"{user}","password":"{pass}"}}"#
            )))
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_sets_session_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        create_user(&state, "admin", "secret", true);
        let app = create_router(Arc::clone(&state))
            .layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));

        let response = app.oneshot(login_request("admin", "secret")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("s="));
        let value = cookie
            .trim_start_matches("s=")
            .split(';')
            .next()
            .unwrap();
        assert!(state.db.get_session(value).unwrap().unwrap().privileged);
    }

    #[tokio::test]
    async fn test_login_rejects_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        create_user(&state, "admin", "secret", true);
        let app = create_router(state)
            .layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 2], 4000))));

        let response = app.oneshot(login_request("admin", "nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_login_is_rate_limited_per_address() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        create_user(&state, "admin", "secret", true);
        let app = create_router(state)
            .layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 3], 4000))));

        let first = app
            .clone()
            .oneshot(login_request("admin", "nope"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::UNAUTHORIZED);

        let second = app.oneshot(login_request("admin", "secret")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_add_user_only_during_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        assert!(state.is_first_run());
        let app = create_router(Arc::clone(&state))
            .layer(MockConnectInfo(SocketAddr::from(([10, 0, 0, 4], 4000))));

        let request = |body: &'static str| {
            Request::builder()
                .method("POST")
                .uri("/!/adduser")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let response = app
            .clone()
            .oneshot(request(r#"{"username":"root","password":"pw"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.is_first_run());
        assert!(state.db.get_user("root").unwrap().unwrap().privileged);

        let response = app
            .oneshot(request(r#"{"username":"other","password":"pw"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_token_requires_session() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = create_router(state);

        let response = app
            .oneshot(Request::get("/!/token").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
