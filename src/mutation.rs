//! Client-requested changes to the served tree.

use std::sync::Arc;

use futures::future::try_join_all;
use thiserror::Error;

use crate::filetree::{FileSystem, FsError};
use crate::paths;
use crate::sync::messages::ClipboardKind;

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("Files are read-only.")]
    ReadOnly,
    #[error("Rejected path: {0}")]
    PathRejected(String),
    #[error("Invalid rename request")]
    InvalidRename,
    #[error("Can't copy directory into itself")]
    IntoItself,
    #[error(transparent)]
    Fs(#[from] FsError),
}

impl MutationError {
    /// Text for the originating view. Rejected paths get no reply.
    pub fn client_text(&self) -> Option<String> {
        match self {
            MutationError::PathRejected(_) => None,
            other => Some(other.to_string()),
        }
    }
}

/// Applies mutations to the tree, enforcing read-only mode and path safety.
///
/// Listings are refreshed through the filesystem's change channel, so nothing
/// here talks to clients.
pub struct Mutations {
    fs: Arc<dyn FileSystem>,
    read_only: bool,
}

impl Mutations {
    pub fn new(fs: Arc<dyn FileSystem>, read_only: bool) -> Self {
        Self { fs, read_only }
    }

    fn check(&self, candidates: &[&str]) -> Result<(), MutationError> {
        if self.read_only {
            return Err(MutationError::ReadOnly);
        }
        for path in candidates {
            if !paths::is_path_sane(path) {
                return Err(MutationError::PathRejected(path.to_string()));
            }
        }
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<(), MutationError> {
        self.check(&[path])?;
        self.fs.delete(path).await?;
        Ok(())
    }

    pub async fn save(&self, to: &str, value: &str) -> Result<(), MutationError> {
        self.check(&[to])?;
        self.fs.save(to, value.as_bytes()).await?;
        Ok(())
    }

    pub async fn mkdir(&self, path: &str) -> Result<(), MutationError> {
        self.check(&[path])?;
        self.fs.mkdir(path).await?;
        Ok(())
    }

    pub async fn create_file(&self, path: &str) -> Result<(), MutationError> {
        self.check(&[path])?;
        self.fs.create_file(path).await?;
        Ok(())
    }

    /// Cut moves, copy duplicates. An occupied destination gets a fresh name.
    pub async fn clipboard(
        &self,
        src: &str,
        dst: &str,
        kind: ClipboardKind,
    ) -> Result<String, MutationError> {
        self.check(&[src, dst])?;
        let src = paths::normalize(src);
        let dst = paths::normalize(dst);
        if paths::file_name(&dst).trim().is_empty() {
            return Err(MutationError::InvalidRename);
        }
        if src != dst && paths::is_within(&src, &dst) {
            return Err(MutationError::IntoItself);
        }

        let dst = self.free_destination(&src, dst).await?;

        match kind {
            ClipboardKind::Cut => self.fs.rename(&src, &dst).await?,
            ClipboardKind::Copy => self.fs.copy(&src, &dst).await?,
        }
        Ok(dst)
    }

    pub async fn rename(&self, src: &str, dst: &str) -> Result<(), MutationError> {
        self.check(&[src, dst])?;
        let (src, dst) = (paths::normalize(src), paths::normalize(dst));
        if paths::file_name(&dst).trim().is_empty() || src == dst {
            return Err(MutationError::InvalidRename);
        }
        if paths::is_within(&src, &dst) {
            return Err(MutationError::IntoItself);
        }
        let dst = self.free_destination(&src, dst).await?;
        self.fs.rename(&src, &dst).await?;
        Ok(())
    }

    /// `dst` itself when nothing occupies it, otherwise a fresh sibling name.
    async fn free_destination(&self, src: &str, dst: String) -> Result<String, MutationError> {
        if src == dst || self.fs.stat(&dst).await.is_ok() {
            Ok(self.fs.unique_path(&dst).await?)
        } else {
            Ok(dst)
        }
    }

    /// Create empty files, making missing parent directories.
    ///
    /// Every path is validated before anything is created.
    pub async fn create_files(&self, files: &[String]) -> Result<(), MutationError> {
        let candidates: Vec<&str> = files.iter().map(String::as_str).collect();
        self.check(&candidates)?;
        try_join_all(files.iter().map(|file| async move {
            self.fs.mkdir(&paths::parent(file)).await?;
            self.fs.create_file(file).await
        }))
        .await?;
        Ok(())
    }

    pub async fn create_folders(&self, folders: &[String]) -> Result<(), MutationError> {
        let candidates: Vec<&str> = folders.iter().map(String::as_str).collect();
        self.check(&candidates)?;
        try_join_all(folders.iter().map(|folder| self.fs.mkdir(folder))).await?;
        Ok(())
    }
}
