use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;

use crate::filetree::FsError;
use crate::sharelinks::ShareLinkError;
use crate::storage::DatabaseError;

/// Handler error. Messages go out as `text/plain` because the browser client
/// shows the response text verbatim.
#[derive(Debug)]
pub enum ApiError {
    /// Client error with a message for the user
    Fail(StatusCode, String),
    /// Server error, details stay in the log
    Error(StatusCode, String),
    /// Status line only
    Empty(StatusCode),
    /// 416 carrying the size of the representation
    RangeNotSatisfiable(u64),
    /// Send the browser back to the start page
    RedirectHome,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Fail(code, msg) | ApiError::Error(code, msg) => (
                code,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                msg,
            )
                .into_response(),
            ApiError::Empty(code) => code.into_response(),
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response()
            }
            ApiError::RedirectHome => {
                (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/")]).into_response()
            }
        }
    }
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::BAD_REQUEST, message.into())
    }

    /// Unsafe path: logged, answered with an empty 400.
    pub fn path_rejected(path: &str) -> Self {
        tracing::info!(path, "Rejected unsafe path");
        ApiError::Empty(StatusCode::BAD_REQUEST)
    }

    pub fn unauthorized() -> Self {
        ApiError::Empty(StatusCode::UNAUTHORIZED)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::FORBIDDEN, message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::NOT_FOUND, message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::CONFLICT, message.into())
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        ApiError::Fail(StatusCode::PAYLOAD_TOO_LARGE, message.into())
    }

    pub fn too_many_requests() -> Self {
        ApiError::Empty(StatusCode::TOO_MANY_REQUESTS)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Error(StatusCode::INTERNAL_SERVER_ERROR, message.into())
    }
}

impl From<FsError> for ApiError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound(_) => ApiError::not_found("Not found"),
            FsError::PermissionDenied(_) => ApiError::forbidden("Permission denied"),
            FsError::AlreadyExists(_) => ApiError::conflict("Already exists"),
            FsError::InvalidPath(path) => ApiError::path_rejected(&path),
            FsError::Io(err) => {
                tracing::error!(error = %err, "Filesystem error");
                ApiError::internal("Filesystem error")
            }
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        tracing::error!(error = %e, "Database error");
        ApiError::internal("Database error")
    }
}

impl From<ShareLinkError> for ApiError {
    fn from(e: ShareLinkError) -> Self {
        tracing::error!(error = %e, "Share link error");
        ApiError::internal("Share link error")
    }
}

/// `axum::Json` that rejects with a readable 400.
pub struct AppJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for AppJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, ApiError> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => {
                let message = match rejection {
                    JsonRejection::JsonDataError(err) => {
                        format!("Invalid request body: {}", err.body_text())
                    }
                    JsonRejection::JsonSyntaxError(_) => "Malformed JSON in request body".into(),
                    JsonRejection::MissingJsonContentType(_) => {
                        "Missing Content-Type: application/json header".into()
                    }
                    _ => "Failed to read request body".into(),
                };
                Err(ApiError::bad_request(message))
            }
        }
    }
}

/// Query string extractor backed by `serde_qs`, rejecting with a readable 400.
pub struct AppQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for AppQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, ApiError> {
        let query = parts.uri.query().unwrap_or_default();
        serde_qs::from_str(query)
            .map(AppQuery)
            .map_err(|e| ApiError::bad_request(friendly_query_error(&e.to_string())))
    }
}

fn friendly_query_error(raw: &str) -> String {
    let cleaned = ["u32", "u8"]
        .iter()
        .fold(raw.to_string(), |msg, ty| msg.replace(ty, "number"));
    format!("Invalid query: {cleaned}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_errors_map_to_statuses() {
        let cases = [
            (FsError::NotFound("/a".into()), StatusCode::NOT_FOUND),
            (FsError::PermissionDenied("/a".into()), StatusCode::FORBIDDEN),
            (FsError::InvalidPath("/..".into()), StatusCode::BAD_REQUEST),
            (
                FsError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_range_error_reports_size() {
        let response = ApiError::RangeNotSatisfiable(1000).into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */1000");
    }

    #[tokio::test]
    async fn test_fail_body_is_plain_text() {
        let response = ApiError::forbidden("Files are read-only.").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"Files are read-only.");
    }

    #[test]
    fn test_redirect_home() {
        let response = ApiError::RedirectHome.into_response();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "/");
    }
}
