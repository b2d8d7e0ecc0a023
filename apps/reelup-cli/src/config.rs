//! CLI configuration.
//!
//! Stored as TOML:
//! - Linux: `$XDG_CONFIG_HOME/reelup/config.toml` (or `~/.config/reelup/config.toml`)
//! - Windows: `%APPDATA%/reelup/config.toml`
//!
//! Every field is optional; command-line flags override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reelup_transport::HttpTransportConfig;
use reelup_uploader::{RetryConfig, UploaderConfig};
use serde::{Deserialize, Serialize};

use crate::cli::Overrides;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Upload server base URL.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Bearer token sent with every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,

    /// Task store directory (defaults to `<config dir>/reelup/tasks`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,

    #[serde(default = "default_chunk_size_mib")]
    pub chunk_size_mib: u64,

    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,

    /// Attempts per chunk before the chunk counts as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Whole-task restarts after a chunk exhausts its attempts.
    #[serde(default)]
    pub max_task_retries: u32,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Upload on the background worker thread.
    #[serde(default = "default_true")]
    pub background: bool,
}

fn default_server_url() -> String {
    "http://localhost:8080".into()
}

fn default_chunk_size_mib() -> u64 {
    5
}

fn default_max_parallel_chunks() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            api_token: None,
            store_dir: None,
            chunk_size_mib: default_chunk_size_mib(),
            max_parallel_chunks: default_max_parallel_chunks(),
            max_attempts: default_max_attempts(),
            max_task_retries: 0,
            timeout_secs: default_timeout_secs(),
            background: default_true(),
        }
    }
}

impl Config {
    /// Loads `path`, or the default location when `None`.
    ///
    /// A missing file at the default location yields defaults; a missing
    /// explicit path is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn with_overrides(mut self, flags: &Overrides) -> Self {
        if let Some(server) = &flags.server {
            self.server_url = server.clone();
        }
        if let Some(token) = &flags.token {
            self.api_token = Some(token.clone());
        }
        if let Some(store) = &flags.store {
            self.store_dir = Some(store.clone());
        }
        if let Some(parallel) = flags.parallel {
            self.max_parallel_chunks = parallel;
        }
        if flags.foreground {
            self.background = false;
        }
        self
    }

    pub fn uploader_config(&self) -> UploaderConfig {
        UploaderConfig::default()
            .with_chunk_size(self.chunk_size_mib.max(1) * MIB)
            .with_max_parallel_chunks(self.max_parallel_chunks)
            .with_max_task_retries(self.max_task_retries)
            .with_retry(RetryConfig::default().with_max_attempts(self.max_attempts))
    }

    pub fn transport_config(&self) -> HttpTransportConfig {
        let config = HttpTransportConfig::new(self.server_url.clone())
            .with_timeout(Duration::from_secs(self.timeout_secs));
        match &self.api_token {
            Some(token) => config.with_api_token(token.clone()),
            None => config,
        }
    }

    pub fn store_dir(&self) -> anyhow::Result<PathBuf> {
        self.store_dir
            .clone()
            .or_else(reelup_task_store::default_store_dir)
            .context("no task store directory; set store_dir or pass --store")
    }
}

fn config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    let base = std::env::var("APPDATA").ok().map(PathBuf::from);

    #[cfg(not(target_os = "windows"))]
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        });

    base.map(|dir| dir.join("reelup").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.server_url, "http://localhost:8080");
        assert_eq!(config.chunk_size_mib, 5);
        assert_eq!(config.max_parallel_chunks, 3);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.max_task_retries, 0);
        assert!(config.background);
        assert_eq!(config.uploader_config(), UploaderConfig::default());
    }

    #[test]
    fn config_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            server_url = "https://media.example.com"
            max_task_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.server_url, "https://media.example.com");
        assert_eq!(config.max_task_retries, 2);
        assert_eq!(config.chunk_size_mib, 5);
        assert!(config.api_token.is_none());
    }

    #[test]
    fn flags_override_file() {
        let flags = Overrides {
            server: Some("http://10.0.0.2:9000".into()),
            token: Some("secret".into()),
            store: Some(PathBuf::from("/tmp/reelup-tasks")),
            parallel: Some(1),
            foreground: true,
        };
        let config = Config::default().with_overrides(&flags);
        assert_eq!(config.server_url, "http://10.0.0.2:9000");
        assert_eq!(config.api_token.as_deref(), Some("secret"));
        assert_eq!(config.store_dir().unwrap(), PathBuf::from("/tmp/reelup-tasks"));
        assert_eq!(config.uploader_config().max_parallel_chunks, 1);
        assert!(!config.background);

        let transport = config.transport_config();
        assert_eq!(transport.base_url, "http://10.0.0.2:9000");
        assert_eq!(transport.api_token.as_deref(), Some("secret"));
    }

    #[test]
    fn load_explicit_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let config = Config {
            chunk_size_mib: 8,
            ..Config::default()
        };
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.uploader_config().chunk_size, 8 * MIB);
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&tmp.path().join("nope.toml"))).is_err());
    }
}
