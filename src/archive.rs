//! On-the-fly zip archives of directories.

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_zip::base::write::ZipFileWriter;
use async_zip::{
    AttributeCompatibility, Compression, ZipDateTime, ZipDateTimeBuilder, ZipEntryBuilder,
};
use chrono::{DateTime, Datelike, Local, Timelike};
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::io::ReaderStream;
use walkdir::WalkDir;

/// Size of the in-memory pipe between the zip encoder and the response body
const PIPE_CAPACITY: usize = 64 * 1024;
/// Entries the directory walk may run ahead of the encoder
const WALK_AHEAD: usize = 64;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Zip error: {0}")]
    Zip(#[from] async_zip::error::ZipError),
    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// One filesystem entry found by the walk, named as it appears in the archive.
struct Walked {
    path: PathBuf,
    name: String,
    is_dir: bool,
    metadata: Metadata,
}

/// Stream a zip of `dir` whose entries all live below a top-level `name/` folder.
///
/// The encoder writes into a bounded pipe, so at most one pipe's worth of
/// compressed data is held in memory. Must be called from within a tokio runtime.
pub fn stream_directory(dir: PathBuf, name: String) -> ReaderStream<tokio::io::DuplexStream> {
    let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);

    tokio::spawn(async move {
        if let Err(e) = write_archive(&dir, &name, writer).await {
            // Usually the client went away mid-download
            tracing::debug!(dir = %dir.display(), error = %e, "Archive stream ended early");
        }
    });

    ReaderStream::new(reader)
}

/// Write a zip of `dir` to `out`, prefixing every entry with `name/`.
///
/// Entries are added in walk order as the blocking walker discovers them.
pub async fn write_archive<W>(dir: &Path, name: &str, out: W) -> Result<(), ArchiveError>
where
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel(WALK_AHEAD);
    let root = dir.to_path_buf();
    let prefix = name.trim_matches('/').to_string();
    let walker = tokio::task::spawn_blocking(move || walk(&root, &prefix, tx));

    let mut zip = ZipFileWriter::with_tokio(out);
    while let Some(entry) = rx.recv().await {
        let entry = entry?;
        if entry.is_dir {
            let name = format!("{}/", entry.name);
            let builder = entry_builder(name, Compression::Stored, &entry.metadata);
            zip.write_entry_whole(builder, &[]).await?;
        } else {
            let builder = entry_builder(entry.name, Compression::Deflate, &entry.metadata);
            let file = tokio::fs::File::open(&entry.path).await?;
            let mut writer = zip.write_entry_stream(builder).await?;
            futures::io::copy(file.compat(), &mut writer).await?;
            writer.close().await?;
        }
    }
    zip.close().await?;

    // The walker only stops early when the receiver is gone
    let _ = walker.await;
    Ok(())
}

fn walk(root: &Path, prefix: &str, tx: mpsc::Sender<Result<Walked, walkdir::Error>>) {
    for entry in WalkDir::new(root).sort_by_file_name() {
        let walked = entry.and_then(|entry| {
            let metadata = entry.metadata()?;
            let mut name = prefix.to_string();
            if let Ok(relative) = entry.path().strip_prefix(root) {
                for component in relative.components() {
                    name.push('/');
                    name.push_str(&component.as_os_str().to_string_lossy());
                }
            }
            Ok(Walked {
                is_dir: entry.file_type().is_dir(),
                path: entry.into_path(),
                name,
                metadata,
            })
        });
        // Sockets, fifos and the like are not archived
        if let Ok(walked) = &walked {
            if !walked.is_dir && !walked.metadata.is_file() {
                continue;
            }
        }
        let failed = walked.is_err();
        if tx.blocking_send(walked).is_err() || failed {
            return;
        }
    }
}

fn entry_builder(name: String, compression: Compression, metadata: &Metadata) -> ZipEntryBuilder {
    let mut builder = ZipEntryBuilder::new(name.into(), compression)
        .attribute_compatibility(AttributeCompatibility::Unix);

    if let Some(time) = metadata.modified().ok().and_then(zip_time) {
        builder = builder.last_modification_date(time);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder = builder.unix_permissions(metadata.permissions().mode() as u16);
    }

    builder
}

/// Zip timestamps are local time and cannot predate 1980.
fn zip_time(time: SystemTime) -> Option<ZipDateTime> {
    let local: DateTime<Local> = time.into();
    if local.year() < 1980 {
        return None;
    }
    Some(
        ZipDateTimeBuilder::new()
            .year(local.year())
            .month(local.month())
            .day(local.day())
            .hour(local.hour())
            .minute(local.minute())
            .second(local.second())
            .build(),
    )
}
