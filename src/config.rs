use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub limits: LimitsConfig,
    /// Serve without authentication; visitors receive unprivileged sessions.
    pub public: bool,
    /// Reject every mutating operation.
    pub read_only: bool,
    /// Watch the client resource directory and push RELOAD on changes.
    pub dev: bool,
    /// Watch the files directory for changes made outside the server.
    pub watch: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Interval between WebSocket pings. Zero disables keep-alive.
    pub keep_alive: Duration,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// Root of the served directory tree
    pub files_dir: PathBuf,
    /// Database and temporary upload storage
    pub data_dir: PathBuf,
    /// Static client resources (html, js, css, images)
    pub client_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Maximum size of a single uploaded file in bytes. Zero means unlimited.
    pub max_file_size: u64,
    /// Throttle interval for directory pushes
    pub update_interval: Duration,
    /// Length of generated share link codes
    pub link_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8989".to_string(),
            keep_alive: Duration::from_millis(20_000),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            files_dir: PathBuf::from("./files"),
            data_dir: PathBuf::from("./data"),
            client_dir: PathBuf::from("./client"),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: 0,
            update_interval: Duration::from_millis(1000),
            link_length: 5,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v == "true" || v == "1")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let server_defaults = ServerConfig::default();
        let limit_defaults = LimitsConfig::default();
        let path_defaults = PathsConfig::default();

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or(server_defaults.bind_address);

        let keep_alive = env_parse::<u64>("KEEP_ALIVE_MS")
            .map(Duration::from_millis)
            .unwrap_or(server_defaults.keep_alive);

        let files_dir = std::env::var("FILES_DIR")
            .map(PathBuf::from)
            .unwrap_or(path_defaults.files_dir);
        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(path_defaults.data_dir);
        let client_dir = std::env::var("CLIENT_DIR")
            .map(PathBuf::from)
            .unwrap_or(path_defaults.client_dir);

        let max_file_size =
            env_parse("MAX_FILE_SIZE").unwrap_or(limit_defaults.max_file_size);
        let update_interval = env_parse::<u64>("UPDATE_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(limit_defaults.update_interval);
        let link_length = env_parse("LINK_LENGTH").unwrap_or(limit_defaults.link_length);

        let config = Config {
            server: ServerConfig {
                bind_address,
                keep_alive,
            },
            paths: PathsConfig {
                files_dir,
                data_dir,
                client_dir,
            },
            limits: LimitsConfig {
                max_file_size,
                update_interval,
                link_length,
            },
            public: env_flag("PUBLIC").unwrap_or(false),
            read_only: env_flag("READ_ONLY").unwrap_or(false),
            dev: env_flag("DEV").unwrap_or(false),
            watch: env_flag("WATCH").unwrap_or(true),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.link_length == 0 || self.limits.link_length > 64 {
            return Err(ConfigError::ValidationError(
                "LINK_LENGTH must be between 1 and 64".to_string(),
            ));
        }

        if self.limits.update_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "UPDATE_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }

        if self.paths.files_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "FILES_DIR cannot be empty".to_string(),
            ));
        }

        if self.public && self.read_only {
            tracing::info!("Serving a public, read-only file tree");
        } else if self.public {
            tracing::warn!(
                "Public mode is enabled: anyone who can reach the server may modify files."
            );
        }

        Ok(())
    }

    /// Directory holding in-flight upload data.
    pub fn temp_dir(&self) -> PathBuf {
        self.paths.data_dir.join("temp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            server: ServerConfig::default(),
            paths: PathsConfig::default(),
            limits: LimitsConfig::default(),
            public: false,
            read_only: false,
            dev: false,
            watch: false,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn test_zero_link_length_rejected() {
        let mut config = base();
        config.limits.link_length = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = base();
        config.limits.update_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_temp_dir_lives_under_data_dir() {
        let config = base();
        assert_eq!(config.temp_dir(), PathBuf::from("./data/temp"));
    }
}
