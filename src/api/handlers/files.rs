use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::session_cookie;
use crate::api::response::ApiError;
use crate::filetree::FsError;
use crate::{archive, paths, AppState};

/// Bytes inspected when guessing whether a file is text
const SNIFF_LEN: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    Full,
    /// Inclusive start and end offsets
    Partial(u64, u64),
    Unsatisfiable,
}

/// Interpret a `Range` header against a file of `size` bytes.
///
/// Only a single `bytes=` range is honored; anything else that does not parse
/// is ignored and the whole file is served.
fn parse_range(value: &str, size: u64) -> ByteRange {
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((start, end)) = spec.split_once('-') else {
        return ByteRange::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        let Ok(suffix) = end.parse::<u64>() else {
            return ByteRange::Full;
        };
        if suffix == 0 || size == 0 {
            return ByteRange::Unsatisfiable;
        }
        return ByteRange::Partial(size.saturating_sub(suffix), size - 1);
    }

    let Ok(start) = start.parse::<u64>() else {
        return ByteRange::Full;
    };
    let end = if end.is_empty() {
        size.saturating_sub(1)
    } else {
        match end.parse::<u64>() {
            Ok(end) if end >= start => end.min(size.saturating_sub(1)),
            _ => return ByteRange::Full,
        }
    };
    if start >= size {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial(start, end)
}

/// A file is binary if its head contains a NUL byte or is not valid UTF-8.
fn looks_binary(head: &[u8]) -> bool {
    if head.contains(&0) {
        return true;
    }
    match std::str::from_utf8(head) {
        Ok(_) => false,
        // A multi-byte character cut off by the sniff window is still text
        Err(e) => e.error_len().is_some(),
    }
}

fn authorize(state: &AppState, jar: &CookieJar) -> Result<(), ApiError> {
    if state.is_authorized(session_cookie(jar).as_deref()) {
        Ok(())
    } else {
        Err(ApiError::RedirectHome)
    }
}

fn locate(state: &AppState, path: &str) -> Result<(String, PathBuf), ApiError> {
    let path = format!("/{}", path.trim_start_matches('/'));
    if !paths::is_path_sane(&path) {
        return Err(ApiError::path_rejected(&path));
    }
    let absolute =
        paths::resolve(state.fs.root(), &path).ok_or_else(|| ApiError::path_rejected(&path))?;
    Ok((paths::normalize(&path), absolute))
}

/// GET /!/dl/*path
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &jar)?;
    let (path, absolute) = locate(&state, &path)?;
    serve_path(&path, absolute, true, &headers).await
}

/// GET /!/file/*path
pub async fn inline(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authorize(&state, &jar)?;
    let (path, absolute) = locate(&state, &path)?;
    serve_path(&path, absolute, false, &headers).await
}

/// GET /!/zip/*path
pub async fn zip(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    jar: CookieJar,
) -> Result<Response, ApiError> {
    authorize(&state, &jar)?;
    let (path, absolute) = locate(&state, &path)?;
    let metadata = tokio::fs::metadata(&absolute)
        .await
        .map_err(|e| FsError::from_io(e, &path))?;
    if !metadata.is_dir() {
        return Err(ApiError::Empty(StatusCode::NOT_FOUND));
    }
    Ok(zip_response(&path, absolute, true))
}

/// GET /!/type/*path answers `binary` or `text`.
pub async fn file_type(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    jar: CookieJar,
) -> Result<Response, ApiError> {
    authorize(&state, &jar)?;
    let (path, absolute) = locate(&state, &path)?;

    let mut file = tokio::fs::File::open(&absolute)
        .await
        .map_err(|e| FsError::from_io(e, &path))?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    (&mut file)
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .await
        .map_err(|e| FsError::from_io(e, &path))?;

    let kind = if looks_binary(&head) { "binary" } else { "text" };
    Ok(([(header::CONTENT_TYPE, "text/plain")], kind).into_response())
}

/// GET /$/:code serves a share link target without a session.
pub async fn share_link(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let Some(link) = state.links.resolve(&code)? else {
        debug!(%code, "Unknown share link");
        return Err(ApiError::RedirectHome);
    };
    let (path, absolute) = locate(&state, &link.location)?;
    serve_path(&path, absolute, link.attachment, &headers).await
}

async fn serve_path(
    path: &str,
    absolute: PathBuf,
    attachment: bool,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let metadata = tokio::fs::metadata(&absolute)
        .await
        .map_err(|e| FsError::from_io(e, path))?;
    if metadata.is_dir() {
        return Ok(zip_response(path, absolute, attachment));
    }

    let size = metadata.len();
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v, size))
        .unwrap_or(ByteRange::Full);

    let mut file = tokio::fs::File::open(&absolute)
        .await
        .map_err(|e| FsError::from_io(e, path))?;

    let mut response_headers = HeaderMap::new();
    let mime = mime_guess::from_path(&absolute).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.essence_str()) {
        response_headers.insert(header::CONTENT_TYPE, value);
    }
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if attachment {
        if let Some(value) = disposition(&paths::file_name(path)) {
            response_headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }

    let (status, body) = match range {
        ByteRange::Unsatisfiable => return Err(ApiError::RangeNotSatisfiable(size)),
        ByteRange::Full => {
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            (StatusCode::OK, Body::from_stream(ReaderStream::new(file)))
        }
        ByteRange::Partial(start, end) => {
            let length = end - start + 1;
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| FsError::from_io(e, path))?;
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{size}")) {
                response_headers.insert(header::CONTENT_RANGE, value);
            }
            (
                StatusCode::PARTIAL_CONTENT,
                Body::from_stream(ReaderStream::new(file.take(length))),
            )
        }
    };

    Ok((status, response_headers, body).into_response())
}

fn zip_response(path: &str, absolute: PathBuf, attachment: bool) -> Response {
    let name = match paths::file_name(path) {
        name if name.is_empty() => "files".to_string(),
        name => name,
    };
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    if attachment {
        if let Some(value) = disposition(&format!("{name}.zip")) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    let stream = archive::stream_directory(absolute, name);
    (headers, Body::from_stream(stream)).into_response()
}

/// `attachment` disposition with an ASCII fallback and a UTF-8 `filename*`.
fn disposition(name: &str) -> Option<HeaderValue> {
    let fallback: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    let encoded: String = name
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect();
    HeaderValue::from_str(&format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}"
    ))
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::api::create_router;
    use crate::testutil::{session_for, test_state};

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-99", 1000), ByteRange::Partial(0, 99));
        assert_eq!(parse_range("bytes=900-", 1000), ByteRange::Partial(900, 999));
        assert_eq!(parse_range("bytes=-100", 1000), ByteRange::Partial(900, 999));
        assert_eq!(parse_range("bytes=-5000", 1000), ByteRange::Partial(0, 999));
        assert_eq!(parse_range("bytes=500-5000", 1000), ByteRange::Partial(500, 999));
        assert_eq!(parse_range("bytes=1000-", 1000), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("bytes=0-0", 0), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("bytes=5-2", 1000), ByteRange::Full);
        assert_eq!(parse_range("bytes=0-1,5-6", 1000), ByteRange::Full);
        assert_eq!(parse_range("items=0-1", 1000), ByteRange::Full);
    }

    #[test]
    fn test_looks_binary() {
        assert!(!looks_binary(b"plain text\n"));
        assert!(!looks_binary("grüße".as_bytes()));
        // Truncated inside a multi-byte character
        assert!(!looks_binary(&"ü".as_bytes()[..1]));
        assert!(looks_binary(b"\x89PNG\r\n\x1a\n\0\0"));
        assert!(looks_binary(&[0xff, 0xfe, 0x41, 0x42]));
    }

    #[test]
    fn test_disposition_escapes_name() {
        let value = disposition("a \"b\" ü.txt").unwrap();
        assert_eq!(
            value.to_str().unwrap(),
            "attachment; filename=\"a _b_ _.txt\"; filename*=UTF-8''a%20%22b%22%20%C3%BC.txt"
        );
    }

    fn get(uri: &str, cookie: &str, range: Option<&str>) -> Request<Body> {
        let mut request = Request::get(uri).header(header::COOKIE, format!("s={cookie}"));
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }
        request.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_range_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(state.config.paths.files_dir.join("data.bin"), &content).unwrap();
        let cookie = session_for(&state, false);
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(get("/!/dl/data.bin", &cookie, Some("bytes=0-99")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "100");
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-99/1000");
        assert!(response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("attachment"));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], &content[..100]);

        let response = app
            .clone()
            .oneshot(get("/!/file/data.bin", &cookie, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "1000");
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
        assert!(response.headers().get(header::CONTENT_DISPOSITION).is_none());

        let response = app
            .oneshot(get("/!/file/data.bin", &cookie, Some("bytes=2000-")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */1000");
    }

    #[tokio::test]
    async fn test_downloads_require_session() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        std::fs::write(state.config.paths.files_dir.join("a.txt"), b"a").unwrap();
        let app = create_router(state);

        let response = app
            .oneshot(get("/!/dl/a.txt", "bogus", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "/");
    }

    #[tokio::test]
    async fn test_unsafe_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let cookie = session_for(&state, false);
        let app = create_router(state);

        let response = app
            .oneshot(get("/!/file/a/%2E%2E/%2E%2E/secret", &cookie, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let cookie = session_for(&state, false);
        let app = create_router(state);

        let response = app
            .oneshot(get("/!/file/nope.txt", &cookie, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_type_sniffing() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let files = state.config.paths.files_dir.clone();
        std::fs::write(files.join("notes.txt"), b"hello").unwrap();
        std::fs::write(files.join("blob.dat"), [0u8, 1, 2, 3]).unwrap();
        let cookie = session_for(&state, false);
        let app = create_router(state);

        for (uri, expected) in [("/!/type/notes.txt", "text"), ("/!/type/blob.dat", "binary")] {
            let response = app.clone().oneshot(get(uri, &cookie, None)).await.unwrap();
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            assert_eq!(&body[..], expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_share_link_serves_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        std::fs::write(state.config.paths.files_dir.join("shared.txt"), b"shared").unwrap();
        let code = state.links.issue("/shared.txt", false).unwrap();
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(Request::get(format!("/$/{code}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"shared");

        let response = app
            .oneshot(Request::get("/$/zzzzz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    }

    #[tokio::test]
    async fn test_zip_of_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        std::fs::write(state.config.paths.files_dir.join("a.txt"), b"a").unwrap();
        std::fs::create_dir(state.config.paths.files_dir.join("docs")).unwrap();
        let cookie = session_for(&state, false);
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(get("/!/zip/a.txt", &cookie, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(get("/!/zip/docs", &cookie, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
    }
}
