use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::{Change, ChangeSender};
use crate::paths;

/// Recursively watch `dir`, calling `on_change` with every modified path.
///
/// The returned watcher stops when dropped.
pub fn watch<F>(dir: &Path, on_change: F) -> notify::Result<RecommendedWatcher>
where
    F: Fn(&Path) + Send + 'static,
{
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            for path in &event.paths {
                on_change(path);
            }
        }
        Err(e) => tracing::warn!(error = %e, "Filesystem watch error"),
    })?;
    watcher.watch(dir, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Feed changes made to the served tree by other processes into the change channel.
pub fn watch_tree(root: PathBuf, changes: ChangeSender) -> notify::Result<RecommendedWatcher> {
    let watch_root = root.clone();
    watch(&root, move |path| {
        if let Some(virtual_path) = paths::to_virtual(&watch_root, path) {
            // Send errors only mean the server is shutting down
            let _ = changes.send(Change::Dir(paths::parent(&virtual_path)));
        }
    })
}
