//! In-memory cache of the web client's static files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use parking_lot::RwLock;
use ring::digest;
use walkdir::WalkDir;

pub const MAIN_PAGE: &str = "main.html";
pub const AUTH_PAGE: &str = "auth.html";
pub const FIRST_RUN_PAGE: &str = "firstrun.html";

#[derive(Debug)]
pub struct Resource {
    pub data: Bytes,
    pub mime: String,
    /// Quoted strong validator derived from the content
    pub etag: String,
}

impl Resource {
    pub fn new(name: &str, data: Bytes) -> Self {
        let mime = mime_guess::from_path(name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let hash = digest::digest(&digest::SHA256, &data);
        let etag = format!("\"{}\"", URL_SAFE_NO_PAD.encode(&hash.as_ref()[..12]));
        Self { data, mime, etag }
    }

    pub fn is_html(&self) -> bool {
        self.mime == "text/html"
    }
}

/// Client files keyed by their slash-separated path below the client directory.
pub struct Resources {
    dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<Resource>>>,
}

impl Resources {
    /// A missing directory yields an empty cache.
    pub fn load<P: AsRef<Path>>(dir: P) -> std::io::Result<Self> {
        let resources = Self {
            dir: dir.as_ref().to_path_buf(),
            cache: RwLock::new(HashMap::new()),
        };
        resources.reload()?;
        Ok(resources)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-read every file. The old cache stays in place if reading fails.
    pub fn reload(&self) -> std::io::Result<usize> {
        if !self.dir.is_dir() {
            tracing::warn!(dir = %self.dir.display(), "Client directory missing, serving no resources");
            self.cache.write().clear();
            return Ok(0);
        }

        let mut fresh = HashMap::new();
        for entry in WalkDir::new(&self.dir) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = crate::paths::to_virtual(&self.dir, entry.path()) else {
                continue;
            };
            let name = name.trim_start_matches('/').to_string();
            let data = Bytes::from(std::fs::read(entry.path())?);
            fresh.insert(name.clone(), Arc::new(Resource::new(&name, data)));
        }

        let count = fresh.len();
        *self.cache.write() = fresh;
        tracing::debug!(count, "Client resources loaded");
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Resource>> {
        self.cache.read().get(name.trim_start_matches('/')).cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("js")).unwrap();
        std::fs::write(dir.path().join("main.html"), b"<html></html>").unwrap();
        std::fs::write(dir.path().join("js/app.js"), b"let a = 1;").unwrap();

        let resources = Resources::load(dir.path()).unwrap();
        assert_eq!(resources.len(), 2);

        let page = resources.get(MAIN_PAGE).unwrap();
        assert!(page.is_html());
        let script = resources.get("js/app.js").unwrap();
        assert!(!script.is_html());
        assert_ne!(page.etag, script.etag);

        std::fs::write(dir.path().join("main.html"), b"<html>v2</html>").unwrap();
        resources.reload().unwrap();
        assert_ne!(resources.get(MAIN_PAGE).unwrap().etag, page.etag);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let resources = Resources::load(dir.path().join("absent")).unwrap();
        assert!(resources.is_empty());
        assert!(resources.get(MAIN_PAGE).is_none());
    }
}
