mod auth;
mod files;
mod pages;
mod socket;
mod upload;

use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::Utc;

use crate::api::response::ApiError;
use crate::auth::{random_token, SESSION_COOKIE};
use crate::storage::models::SessionRecord;
use crate::AppState;

pub use auth::{add_user, login, logout, token};
pub use files::{download, file_type, inline, share_link, zip};
pub use pages::{index, resource};
pub use socket::socket;
pub use upload::upload;

/// Session cookie value carried by a request.
fn session_cookie(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE).map(|c| c.value().to_string())
}

/// Persist a fresh session and build the cookie that names it.
fn create_session(state: &AppState, privileged: bool) -> Result<Cookie<'static>, ApiError> {
    let value = random_token(&state.rng, 32)
        .map_err(|_| ApiError::internal("Failed to generate session"))?;
    state.db.put_session(
        &value,
        &SessionRecord {
            privileged,
            last_seen: Utc::now(),
        },
    )?;

    Ok(Cookie::build((SESSION_COOKIE, value))
        .path("/")
        .http_only(true)
        .same_site(axum_extra::extract::cookie::SameSite::Strict)
        .permanent()
        .build())
}

/// Cookie removal needs the same path the cookie was set with.
fn expired_session_cookie() -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE).path("/").build()
}
