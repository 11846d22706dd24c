mod local;
mod watch;

pub use local::LocalFileSystem;
pub use watch::{watch, watch_tree};

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Classify an IO error, tagging it with the virtual path it concerns.
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            ErrorKind::PermissionDenied => FsError::PermissionDenied(path.to_string()),
            ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
            _ => FsError::Io(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    #[serde(rename = "f")]
    File,
    #[serde(rename = "d")]
    Directory,
}

/// Listing entry as pushed to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryInfo {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    /// Modification time in milliseconds since the epoch
    pub mtime: i64,
}

impl EntryInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Directory contents keyed by entry name
pub type DirListing = BTreeMap<String, EntryInfo>;

/// A path-level change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// The listing of this virtual directory changed
    Dir(String),
    /// Everything may have changed (e.g. after a rescan)
    All,
}

pub type ChangeSender = mpsc::UnboundedSender<Change>;
pub type ChangeReceiver = mpsc::UnboundedReceiver<Change>;

/// The directory tree the server exposes.
///
/// Paths are virtual (`/a/b.txt`) and must have passed validation already.
/// Mutating operations announce the directories they touched on the change
/// channel once they complete.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// On-disk root of the tree
    fn root(&self) -> &Path;

    async fn stat(&self, path: &str) -> Result<EntryInfo, FsError>;
    async fn list_dir(&self, path: &str) -> Result<DirListing, FsError>;
    async fn mkdir(&self, path: &str) -> Result<(), FsError>;
    async fn create_file(&self, path: &str) -> Result<(), FsError>;
    async fn delete(&self, path: &str) -> Result<(), FsError>;
    async fn save(&self, path: &str, data: &[u8]) -> Result<(), FsError>;
    async fn rename(&self, src: &str, dst: &str) -> Result<(), FsError>;
    async fn copy(&self, src: &str, dst: &str) -> Result<(), FsError>;

    /// A sibling of `path` that does not exist at call time.
    async fn unique_path(&self, path: &str) -> Result<String, FsError>;

    /// Move a finished temporary file into the tree without announcing it.
    async fn commit_temp(&self, temp: &Path, dst: &str) -> Result<(), FsError>;

    /// Announce that the listing of `dir` changed.
    fn mark_changed(&self, dir: &str);
}
