use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::session_cookie;
use crate::api::response::{ApiError, AppQuery};
use crate::sync::ServerMessage;
use crate::upload::{UploadBatch, UploadError, UPLOAD_TIMEOUT};
use crate::{paths, AppState};

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    /// Destination directory. Empty means the directory shown by `vId`.
    pub to: String,
    #[serde(rename = "vId", default)]
    pub view_id: u32,
    /// `1` picks a fresh name instead of replacing existing files
    #[serde(default)]
    pub r: u8,
}

/// POST /!/upload
pub async fn upload(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    AppQuery(params): AppQuery<UploadParams>,
    mut multipart: Multipart,
) -> Result<StatusCode, ApiError> {
    let cookie = session_cookie(&jar);
    if !state.is_authorized(cookie.as_deref()) {
        info!("Aborted unauthorized upload request");
        return Err(ApiError::unauthorized());
    }
    if state.config.read_only {
        info!("Upload cancelled because of read-only mode");
        return Err(ApiError::forbidden("Files are read-only."));
    }
    if !paths::is_path_sane(&params.to) {
        return Err(ApiError::path_rejected(&params.to));
    }

    let dest_dir = if params.to.is_empty() {
        cookie
            .as_deref()
            .and_then(|c| state.hub.connection_for_session(c))
            .and_then(|id| state.hub.view_directory(id, params.view_id))
            .unwrap_or_else(|| "/".to_string())
    } else {
        paths::normalize(&params.to)
    };

    // Closing the session's socket aborts the transfer
    let cancel = cookie
        .as_deref()
        .and_then(|c| state.hub.session_token(c))
        .unwrap_or_else(|| state.hub.shutdown_token().child_token());

    info!(to = %dest_dir, "Upload started");
    let mut batch = UploadBatch::new(state.config.temp_dir(), state.config.limits.max_file_size);
    let received = receive_all(&mut batch, &mut multipart, &cancel).await;

    let result = match received {
        Ok(()) => batch
            .finalize(state.fs.as_ref(), &dest_dir, params.r == 1)
            .await
            .map(|placed| placed.len()),
        Err(e) => Err(e),
    };

    match result {
        Ok(count) => {
            info!(to = %dest_dir, files = count, "Upload finished");
            Ok(StatusCode::OK)
        }
        Err(e) => {
            if let (UploadError::LimitExceeded { .. }, Some(cookie)) = (&e, cookie.as_deref()) {
                state
                    .hub
                    .send_to_session(cookie, ServerMessage::error(params.view_id, e.to_string()))
                    .await;
            }
            Err(upload_error(e))
        }
    }
}

async fn receive_all(
    batch: &mut UploadBatch,
    multipart: &mut Multipart,
    cancel: &CancellationToken,
) -> Result<(), UploadError> {
    let transfer = async {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| UploadError::Stream(e.to_string()))?
        {
            let Some(name) = field.file_name().map(str::to_string) else {
                continue;
            };
            batch.receive(&name, field).await?;
        }
        Ok::<(), UploadError>(())
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        result = tokio::time::timeout(UPLOAD_TIMEOUT, transfer) => {
            result.unwrap_or(Err(UploadError::TimedOut))
        }
    }
}

fn upload_error(e: UploadError) -> ApiError {
    match e {
        UploadError::LimitExceeded { .. } => {
            info!(error = %e, "Upload rejected");
            ApiError::payload_too_large(e.to_string())
        }
        UploadError::PathRejected(path) => ApiError::path_rejected(&path),
        UploadError::Stream(msg) => {
            info!(error = %msg, "Upload stream aborted");
            ApiError::bad_request("Upload aborted")
        }
        UploadError::Cancelled => {
            info!("Upload cancelled");
            ApiError::Empty(StatusCode::SERVICE_UNAVAILABLE)
        }
        UploadError::TimedOut => {
            warn!("Upload timed out");
            ApiError::Empty(StatusCode::REQUEST_TIMEOUT)
        }
        UploadError::Fs(e) => e.into(),
        UploadError::Io(e) => {
            warn!(error = %e, "Upload failed");
            ApiError::internal("Upload failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    use crate::api::create_router;
    use crate::testutil::{session_for, test_state, test_state_with};

    const BOUNDARY: &str = "XBOUNDARYX";

    fn multipart_body(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, data) in files {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(uri: &str, cookie: &str, body: Vec<u8>) -> Request<Body> {
        Request::post(uri)
            .header(header::COOKIE, format!("s={cookie}"))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_into_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let cookie = session_for(&state, false);
        let app = create_router(Arc::clone(&state));

        let body = multipart_body(&[("a.txt", b"alpha"), ("nested/b.txt", b"beta")]);
        let response = app
            .oneshot(upload_request("/!/upload?to=/new&vId=0", &cookie, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let files = &state.config.paths.files_dir;
        assert_eq!(std::fs::read(files.join("new/a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(files.join("new/nested/b.txt")).unwrap(), b"beta");
        assert_eq!(std::fs::read_dir(state.config.temp_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_rename_on_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let files = state.config.paths.files_dir.clone();
        std::fs::write(files.join("a.txt"), b"old").unwrap();
        let cookie = session_for(&state, false);
        let app = create_router(Arc::clone(&state));

        let body = multipart_body(&[("a.txt", b"new")]);
        let response = app
            .oneshot(upload_request("/!/upload?to=/&r=1", &cookie, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(std::fs::read(files.join("a.txt")).unwrap(), b"old");
        let names: Vec<String> = std::fs::read_dir(&files)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
    }

    #[tokio::test]
    async fn test_upload_limit_removes_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state_with(&dir, |config| config.limits.max_file_size = 4);
        let cookie = session_for(&state, false);
        let app = create_router(Arc::clone(&state));

        let body = multipart_body(&[("big.bin", b"0123456789")]);
        let response = app
            .oneshot(upload_request("/!/upload?to=/", &cookie, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(!state.config.paths.files_dir.join("big.bin").exists());
        assert_eq!(std::fs::read_dir(state.config.temp_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_requires_session_and_write_access() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = create_router(Arc::clone(&state));
        let response = app
            .oneshot(upload_request("/!/upload?to=/", "bogus", multipart_body(&[])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let dir = tempfile::tempdir().unwrap();
        let state = test_state_with(&dir, |config| config.read_only = true);
        let cookie = session_for(&state, false);
        let app = create_router(Arc::clone(&state));
        let response = app
            .oneshot(upload_request("/!/upload?to=/", &cookie, multipart_body(&[])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
