//! live-files - A self-hosted web file manager backend
//!
//! Serves a directory tree over HTTP and WebSocket and keeps every connected
//! client's view of it up to date:
//! - Per-directory subscriptions with throttled pushes (`sync`)
//! - Mutations and streamed uploads with path validation (`mutation`, `upload`)
//! - Share links persisted in redb (`sharelinks`, `storage`)
//! - Zip streaming and ranged file downloads (`archive`, `api`)

pub mod api;
pub mod archive;
pub mod auth;
pub mod config;
pub mod filetree;
pub mod mutation;
pub mod paths;
pub mod resources;
pub mod sharelinks;
pub mod storage;
pub mod sync;
pub mod upload;
#[cfg(test)]
pub mod testutil;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ring::rand::SystemRandom;
use thiserror::Error;
use tokio::sync::mpsc;

use auth::{Csrf, LoginLimiter, LOGIN_COOLDOWN};
use config::Config;
use filetree::{ChangeSender, FileSystem, LocalFileSystem};
use mutation::Mutations;
use resources::Resources;
use sharelinks::ShareLinks;
use storage::models::SessionRecord;
use storage::{Database, DatabaseError};
use sync::Hub;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub fs: Arc<dyn FileSystem>,
    pub hub: Arc<Hub>,
    pub changes: ChangeSender,
    pub mutations: Mutations,
    pub links: ShareLinks,
    pub resources: Resources,
    pub csrf: Csrf,
    pub login_limiter: LoginLimiter,
    pub rng: SystemRandom,
    first_run: AtomicBool,
}

impl AppState {
    /// Prepare directories and storage and start the change listener.
    ///
    /// Leftover upload data is discarded. `config.paths.files_dir` is replaced
    /// by its canonical form. Must be called from within a tokio runtime.
    pub fn build(mut config: Config) -> Result<Arc<Self>, StartupError> {
        std::fs::create_dir_all(&config.paths.files_dir)?;
        config.paths.files_dir = std::fs::canonicalize(&config.paths.files_dir)?;

        let temp_dir = config.temp_dir();
        if temp_dir.exists() {
            std::fs::remove_dir_all(&temp_dir)?;
        }
        std::fs::create_dir_all(&temp_dir)?;

        let db = Database::open(&config.paths.data_dir)?;

        let (changes, receiver) = mpsc::unbounded_channel();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(
            &config.paths.files_dir,
            changes.clone(),
        )?);
        let hub = Arc::new(Hub::new(Arc::clone(&fs), config.limits.update_interval));
        tokio::spawn(Arc::clone(&hub).listen(receiver));

        let first_run = !config.public && !db.has_users()?;
        if first_run {
            let cleared = db.clear_sessions()?;
            tracing::info!(cleared, "No users configured, entering first-run mode");
        }

        let resources = Resources::load(&config.paths.client_dir)?;

        Ok(Arc::new(Self {
            mutations: Mutations::new(Arc::clone(&fs), config.read_only),
            links: ShareLinks::new(db.clone(), config.limits.link_length),
            resources,
            csrf: Csrf::new(),
            login_limiter: LoginLimiter::new(LOGIN_COOLDOWN),
            rng: SystemRandom::new(),
            first_run: AtomicBool::new(first_run),
            config,
            db,
            fs,
            hub,
            changes,
        }))
    }

    /// True while no user exists and the first one may be created.
    pub fn is_first_run(&self) -> bool {
        self.first_run.load(Ordering::SeqCst)
    }

    pub fn set_first_run(&self, first_run: bool) {
        self.first_run.store(first_run, Ordering::SeqCst);
    }

    /// Stored session for a cookie value, if any.
    pub fn session(&self, cookie: &str) -> Option<SessionRecord> {
        match self.db.get_session(cookie) {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read session");
                None
            }
        }
    }

    /// Requests need a known session unless the server is public.
    pub fn is_authorized(&self, cookie: Option<&str>) -> bool {
        self.config.public || cookie.is_some_and(|c| self.session(c).is_some())
    }

    pub fn is_privileged(&self, cookie: Option<&str>) -> bool {
        cookie
            .and_then(|c| self.session(c))
            .is_some_and(|s| s.privileged)
    }
}
