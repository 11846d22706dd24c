//! Streaming uploads into temporary files and committing them into the tree.

use std::collections::{BTreeSet, HashSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::filetree::{FileSystem, FsError};
use crate::paths;

/// Upper bound on temp files being moved at the same time
pub const MAX_CONCURRENT_MOVES: usize = 64;

/// Uploads may take this long before they are abandoned
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Maximum upload size of {} exceeded.", format_limit(.limit))]
    LimitExceeded { name: String, limit: u64 },
    #[error("Rejected path: {0}")]
    PathRejected(String),
    #[error("Upload stream failed: {0}")]
    Stream(String),
    #[error("Upload cancelled")]
    Cancelled,
    #[error("Upload timed out")]
    TimedOut,
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_limit(limit: &u64) -> String {
    format_bytes(*limit)
}

/// Human readable byte count, e.g. `1.5 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[derive(Debug)]
struct Received {
    relative: String,
    temp: PathBuf,
}

/// Files of one upload request, held in temporary storage until committed.
///
/// Temp files that were not moved into the tree are deleted when the batch is
/// dropped, so an aborted or cancelled request leaves nothing behind.
#[derive(Debug)]
pub struct UploadBatch {
    temp_dir: PathBuf,
    max_file_size: u64,
    files: Vec<Received>,
}

impl UploadBatch {
    /// `max_file_size` of 0 means unlimited.
    pub fn new<P: AsRef<Path>>(temp_dir: P, max_file_size: u64) -> Self {
        Self {
            temp_dir: temp_dir.as_ref().to_path_buf(),
            max_file_size,
            files: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Stream one file, chunk by chunk, into a fresh temp file.
    ///
    /// `relative` is the file's path below the upload's destination directory.
    pub async fn receive<S, E>(&mut self, relative: &str, chunks: S) -> Result<u64, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        if !paths::is_path_sane(relative) || paths::file_name(relative).is_empty() {
            return Err(UploadError::PathRejected(relative.to_string()));
        }

        let temp = self.temp_dir.join(uuid::Uuid::new_v4().simple().to_string());
        let mut file = tokio::fs::File::create(&temp).await?;
        self.files.push(Received {
            relative: paths::normalize(relative),
            temp,
        });

        let mut written = 0u64;
        tokio::pin!(chunks);
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| UploadError::Stream(e.to_string()))?;
            written += chunk.len() as u64;
            if self.max_file_size > 0 && written > self.max_file_size {
                return Err(UploadError::LimitExceeded {
                    name: relative.to_string(),
                    limit: self.max_file_size,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Move every received file below `dest_dir`.
    ///
    /// Missing parent directories are created. An existing file is replaced
    /// unless `rename_on_conflict` is set, in which case the upload gets a
    /// fresh name. Returns the virtual paths the files were placed at.
    pub async fn finalize(
        self,
        fs: &dyn FileSystem,
        dest_dir: &str,
        rename_on_conflict: bool,
    ) -> Result<Vec<String>, UploadError> {
        if !paths::is_path_sane(dest_dir) {
            return Err(UploadError::PathRejected(dest_dir.to_string()));
        }
        let dest_dir = paths::normalize(dest_dir);

        let mut parents = BTreeSet::new();
        let mut planned = HashSet::with_capacity(self.files.len());
        let mut plan = Vec::with_capacity(self.files.len());
        for received in &self.files {
            let target = paths::join(&dest_dir, &received.relative);
            let parent = paths::parent(&target);
            if !parents.contains(&parent) {
                fs.mkdir(&parent).await?;
                parents.insert(parent);
            }

            let target = if rename_on_conflict {
                free_target(fs, target, &planned).await
            } else {
                target
            };
            planned.insert(target.clone());
            plan.push((received.temp.clone(), target));
        }

        let results: Vec<Option<String>> = futures::stream::iter(plan)
            .map(move |(temp, target)| async move {
                match fs.commit_temp(&temp, &target).await {
                    Ok(()) => Some(target),
                    Err(e) => {
                        warn!(path = %target, error = %e, "Failed to move upload into place");
                        None
                    }
                }
            })
            .buffer_unordered(MAX_CONCURRENT_MOVES)
            .collect()
            .await;

        for parent in &parents {
            fs.mark_changed(parent);
        }

        let placed: Vec<String> = results.into_iter().flatten().collect();
        debug!(%dest_dir, files = placed.len(), "Upload committed");
        Ok(placed)
    }
}

/// First name at or after `target` that is neither on disk nor claimed by
/// another file of the same batch.
async fn free_target(fs: &dyn FileSystem, target: String, planned: &HashSet<String>) -> String {
    let taken = |candidate: &str| planned.contains(candidate);
    if !taken(&target) && fs.stat(&target).await.is_err() {
        return target;
    }
    let mut counter = 2u64;
    loop {
        let candidate = paths::numbered(&target, counter);
        if !taken(&candidate) && fs.stat(&candidate).await.is_err() {
            return candidate;
        }
        counter += 1;
    }
}

impl Drop for UploadBatch {
    fn drop(&mut self) {
        for received in &self.files {
            if let Err(e) = std::fs::remove_file(&received.temp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %received.temp.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
    }
}
