use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use super::{Change, ChangeSender, DirListing, EntryInfo, EntryKind, FileSystem, FsError};
use crate::paths;

/// The served tree on the local disk.
pub struct LocalFileSystem {
    root: PathBuf,
    changes: ChangeSender,
}

impl LocalFileSystem {
    pub fn new<P: AsRef<Path>>(root: P, changes: ChangeSender) -> Result<Self, std::io::Error> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, changes })
    }

    fn locate(&self, path: &str) -> Result<PathBuf, FsError> {
        paths::resolve(&self.root, path).ok_or_else(|| FsError::InvalidPath(path.to_string()))
    }
}

fn entry_info(metadata: &std::fs::Metadata) -> EntryInfo {
    let mtime = metadata
        .modified()
        .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
        .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH).timestamp_millis());
    let kind = if metadata.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    EntryInfo {
        kind,
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        mtime,
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn move_path(src: &Path, dst: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(e),
        Err(_) => {
            // Rename fails across filesystems; fall back to copy and remove.
            let metadata = tokio::fs::metadata(src).await?;
            if metadata.is_dir() {
                let (from, to) = (src.to_path_buf(), dst.to_path_buf());
                tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                    .await
                    .map_err(|e| std::io::Error::new(ErrorKind::Other, e))??;
                tokio::fs::remove_dir_all(src).await
            } else {
                tokio::fs::copy(src, dst).await?;
                tokio::fs::remove_file(src).await
            }
        }
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn stat(&self, path: &str) -> Result<EntryInfo, FsError> {
        let location = self.locate(path)?;
        let metadata = tokio::fs::metadata(&location)
            .await
            .map_err(|e| FsError::from_io(e, path))?;
        Ok(entry_info(&metadata))
    }

    async fn list_dir(&self, path: &str) -> Result<DirListing, FsError> {
        let location = self.locate(path)?;
        let mut reader = tokio::fs::read_dir(&location)
            .await
            .map_err(|e| FsError::from_io(e, path))?;

        let mut listing = DirListing::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| FsError::from_io(e, path))?
        {
            // Entries may vanish between readdir and stat
            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            listing.insert(
                entry.file_name().to_string_lossy().into_owned(),
                entry_info(&metadata),
            );
        }
        Ok(listing)
    }

    async fn mkdir(&self, path: &str) -> Result<(), FsError> {
        let location = self.locate(path)?;
        tokio::fs::create_dir_all(&location)
            .await
            .map_err(|e| FsError::from_io(e, path))?;
        self.mark_changed(&paths::parent(path));
        Ok(())
    }

    async fn create_file(&self, path: &str) -> Result<(), FsError> {
        let location = self.locate(path)?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&location)
            .await
            .map_err(|e| FsError::from_io(e, path))?;
        self.mark_changed(&paths::parent(path));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), FsError> {
        let location = self.locate(path)?;
        if location == self.root {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        let metadata = tokio::fs::symlink_metadata(&location)
            .await
            .map_err(|e| FsError::from_io(e, path))?;
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&location).await
        } else {
            tokio::fs::remove_file(&location).await
        };
        result.map_err(|e| FsError::from_io(e, path))?;
        self.mark_changed(&paths::parent(path));
        Ok(())
    }

    async fn save(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let location = self.locate(path)?;
        tokio::fs::write(&location, data)
            .await
            .map_err(|e| FsError::from_io(e, path))?;
        self.mark_changed(&paths::parent(path));
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<(), FsError> {
        let from = self.locate(src)?;
        let to = self.locate(dst)?;
        move_path(&from, &to)
            .await
            .map_err(|e| FsError::from_io(e, src))?;
        self.mark_changed(&paths::parent(src));
        self.mark_changed(&paths::parent(dst));
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), FsError> {
        let from = self.locate(src)?;
        let to = self.locate(dst)?;
        let metadata = tokio::fs::metadata(&from)
            .await
            .map_err(|e| FsError::from_io(e, src))?;
        if metadata.is_dir() {
            tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                .await
                .map_err(|e| FsError::Io(std::io::Error::new(ErrorKind::Other, e)))?
                .map_err(|e| FsError::from_io(e, src))?;
        } else {
            tokio::fs::copy(&from, &to)
                .await
                .map_err(|e| FsError::from_io(e, src))?;
        }
        self.mark_changed(&paths::parent(dst));
        Ok(())
    }

    async fn unique_path(&self, path: &str) -> Result<String, FsError> {
        let location = self.locate(path)?;
        if !tokio::fs::try_exists(&location).await? {
            return Ok(paths::normalize(path));
        }

        let mut counter = 2u64;
        loop {
            let candidate = paths::numbered(path, counter);
            let candidate_location = self.locate(&candidate)?;
            if !tokio::fs::try_exists(&candidate_location).await? {
                return Ok(candidate);
            }
            counter += 1;
        }
    }

    async fn commit_temp(&self, temp: &Path, dst: &str) -> Result<(), FsError> {
        let to = self.locate(dst)?;
        move_path(temp, &to)
            .await
            .map_err(|e| FsError::from_io(e, dst))
    }

    fn mark_changed(&self, dir: &str) {
        if self.changes.send(Change::Dir(paths::normalize(dir))).is_err() {
            tracing::debug!(dir, "Change listener is gone, dropping notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn fixture() -> (
        tempfile::TempDir,
        LocalFileSystem,
        mpsc::UnboundedReceiver<Change>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let fs = LocalFileSystem::new(dir.path().join("files"), tx).unwrap();
        (dir, fs, rx)
    }

    #[tokio::test]
    async fn test_mkdir_announces_parent() {
        let (_dir, fs, mut rx) = fixture();
        fs.mkdir("/a/b").await.unwrap();
        assert!(fs.stat("/a/b").await.unwrap().is_dir());
        assert_eq!(rx.recv().await, Some(Change::Dir("/a".to_string())));
    }

    #[tokio::test]
    async fn test_list_dir() {
        let (_dir, fs, _rx) = fixture();
        fs.save("/hello.txt", b"hello").await.unwrap();
        fs.mkdir("/sub").await.unwrap();

        let listing = fs.list_dir("/").await.unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing["hello.txt"].size, 5);
        assert_eq!(listing["hello.txt"].kind, EntryKind::File);
        assert!(listing["sub"].is_dir());
    }

    #[tokio::test]
    async fn test_unique_path() {
        let (_dir, fs, _rx) = fixture();
        assert_eq!(fs.unique_path("/a.txt").await.unwrap(), "/a.txt");

        fs.save("/a.txt", b"1").await.unwrap();
        assert_eq!(fs.unique_path("/a.txt").await.unwrap(), "/a-2.txt");

        fs.save("/a-2.txt", b"2").await.unwrap();
        assert_eq!(fs.unique_path("/a.txt").await.unwrap(), "/a-3.txt");

        fs.mkdir("/folder").await.unwrap();
        assert_eq!(fs.unique_path("/folder").await.unwrap(), "/folder-2");
    }

    #[tokio::test]
    async fn test_copy_directory_recursively() {
        let (_dir, fs, _rx) = fixture();
        fs.mkdir("/src/nested").await.unwrap();
        fs.save("/src/nested/file.txt", b"content").await.unwrap();

        fs.copy("/src", "/dst").await.unwrap();
        assert_eq!(fs.stat("/dst/nested/file.txt").await.unwrap().size, 7);
        assert!(fs.stat("/src/nested/file.txt").await.is_ok());
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let (_dir, fs, _rx) = fixture();
        fs.save("/old.txt", b"x").await.unwrap();
        fs.rename("/old.txt", "/new.txt").await.unwrap();
        assert!(matches!(
            fs.stat("/old.txt").await,
            Err(FsError::NotFound(_))
        ));

        fs.delete("/new.txt").await.unwrap();
        assert!(matches!(
            fs.stat("/new.txt").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_root_cannot_be_deleted() {
        let (_dir, fs, _rx) = fixture();
        assert!(matches!(fs.delete("/").await, Err(FsError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_create_file_refuses_existing() {
        let (_dir, fs, _rx) = fixture();
        fs.create_file("/empty").await.unwrap();
        assert_eq!(fs.stat("/empty").await.unwrap().size, 0);
        assert!(matches!(
            fs.create_file("/empty").await,
            Err(FsError::AlreadyExists(_))
        ));
    }
}
