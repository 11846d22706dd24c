//! Virtual path handling.
//!
//! Clients address files with slash-separated paths relative to the served root
//! (`/`, `/docs`, `/docs/a.txt`). Every filesystem-affecting request goes through
//! [`is_path_sane`] before any side effect, and through [`resolve`] to obtain the
//! on-disk location.

use std::path::{Component, Path, PathBuf};

/// Returns false for paths that contain null bytes or parent-directory segments.
pub fn is_path_sane(path: &str) -> bool {
    if path.contains('\0') {
        return false;
    }
    !path.split(['/', '\\']).any(|segment| segment == "..")
}

/// Canonical virtual form: leading slash, no empty or `.` segments, no trailing slash.
pub fn normalize(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Parent directory of a virtual path. The root is its own parent.
pub fn parent(path: &str) -> String {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Last segment of a virtual path, empty for the root.
pub fn file_name(path: &str) -> String {
    let path = normalize(path);
    path.rsplit('/').next().unwrap_or_default().to_string()
}

/// Join a virtual directory and a relative path.
pub fn join(dir: &str, relative: &str) -> String {
    normalize(&format!("{}/{}", dir, relative))
}

/// Numbered sibling of a path: `/d/a.txt` becomes `/d/a-2.txt` for `counter` 2.
pub fn numbered(path: &str, counter: u64) -> String {
    let name = file_name(path);
    let as_path = Path::new(&name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());
    let extension = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    join(&parent(path), &format!("{stem}-{counter}{extension}"))
}

/// Resolve a virtual path to its location under `root`.
///
/// Returns `None` when the path is unsafe or would escape the root.
pub fn resolve(root: &Path, path: &str) -> Option<PathBuf> {
    if !is_path_sane(path) {
        return None;
    }
    let mut resolved = root.to_path_buf();
    for component in Path::new(normalize(path).trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    resolved.starts_with(root).then_some(resolved)
}

/// Convert an absolute location below `root` back into its virtual path.
pub fn to_virtual(root: &Path, absolute: &Path) -> Option<String> {
    let relative = absolute.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Some(normalize(&parts.join("/")))
}

/// True when `candidate` is `dir` itself or lies below it.
pub fn is_within(dir: &str, candidate: &str) -> bool {
    let dir = normalize(dir);
    let candidate = normalize(candidate);
    dir == "/" || candidate == dir || candidate.starts_with(&format!("{dir}/"))
}
