//! Shared test helpers for live-files unit tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ring::rand::SystemRandom;

use crate::auth::{hash_password, random_token};
use crate::config::{Config, LimitsConfig, PathsConfig, ServerConfig};
use crate::storage::models::SessionRecord;
use crate::AppState;

/// Configuration rooted in a temporary directory.
pub fn test_config(temp_dir: &tempfile::TempDir) -> Config {
    Config {
        server: ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            keep_alive: Duration::ZERO,
        },
        paths: PathsConfig {
            files_dir: temp_dir.path().join("files"),
            data_dir: temp_dir.path().join("data"),
            client_dir: temp_dir.path().join("client"),
        },
        limits: LimitsConfig {
            update_interval: Duration::from_millis(50),
            ..LimitsConfig::default()
        },
        public: false,
        read_only: false,
        dev: false,
        watch: false,
    }
}

/// Create a test AppState with a temporary database and files directory.
/// Must be called from within a tokio runtime.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    test_state_with(temp_dir, |_| {})
}

pub fn test_state_with<F>(temp_dir: &tempfile::TempDir, customize: F) -> Arc<AppState>
where
    F: FnOnce(&mut Config),
{
    let mut config = test_config(temp_dir);
    customize(&mut config);
    AppState::build(config).expect("Failed to build test state")
}

pub fn create_user(state: &AppState, name: &str, password: &str, privileged: bool) {
    let record = hash_password(&SystemRandom::new(), password, privileged)
        .expect("Failed to hash password");
    state.db.put_user(name, &record).expect("Failed to store user");
}

/// Store a session and return its cookie value.
pub fn session_for(state: &AppState, privileged: bool) -> String {
    let cookie = random_token(&SystemRandom::new(), 32).expect("Failed to generate cookie");
    state
        .db
        .put_session(
            &cookie,
            &SessionRecord {
                privileged,
                last_seen: Utc::now(),
            },
        )
        .expect("Failed to store session");
    cookie
}

/// Place a file in the client resource directory. Call before building the state.
pub fn write_client_file(temp_dir: &tempfile::TempDir, name: &str, content: &str) {
    let path = temp_dir.path().join("client").join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create client dir");
    }
    std::fs::write(path, content).expect("Failed to write client file");
}
