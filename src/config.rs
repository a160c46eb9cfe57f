//! Airdock configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main Airdock configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listener configuration
    pub server: ServerConfig,

    /// Working tree and on-disk state locations
    pub project: ProjectConfig,

    /// Agent engine configuration
    pub engine: EngineConfig,

    /// Git coordinator configuration
    pub git: GitConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on (0 picks a free port)
    pub port: u16,

    /// Shared secret expected in the `secret` query parameter
    pub secret: Option<String>,

    /// Maximum accepted upload body size in bytes
    pub upload_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3847,
            secret: None,
            upload_limit_bytes: 25 * 1024 * 1024,
        }
    }
}

/// Working tree and on-disk state locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Root of the working tree the agent operates on.
    /// `None` means the current directory.
    pub root: Option<PathBuf>,

    /// Session file name, relative to the project root
    pub session_file: String,

    /// Image directory name, relative to the project root
    pub image_dir: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: None,
            session_file: ".airdock.local.json".to_string(),
            image_dir: ".airdock-images".to_string(),
        }
    }
}

impl ProjectConfig {
    /// Resolved project root
    pub fn root_dir(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    /// Absolute path of the session file
    pub fn session_path(&self) -> PathBuf {
        self.root_dir().join(&self.session_file)
    }

    /// Absolute path of the image directory
    pub fn image_path(&self) -> PathBuf {
        self.root_dir().join(&self.image_dir)
    }
}

/// Agent engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path or name of the `claude` binary
    pub binary: PathBuf,

    /// Permission mode passed to the engine
    pub permission_mode: String,

    /// Text appended to the engine's system prompt
    pub append_system_prompt: Option<String>,

    /// Extra command-line arguments
    pub extra_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("claude"),
            permission_mode: "bypassPermissions".to_string(),
            append_system_prompt: Some(DEFAULT_APPEND_PROMPT.to_string()),
            extra_args: Vec::new(),
        }
    }
}

const DEFAULT_APPEND_PROMPT: &str = "You are running inside Airdock, a local development \
broker. The developer drives you from a widget on their phone while the app hot-reloads. \
Do not add new packages unless the user explicitly asks for it: new native dependencies \
force a full rebuild of the app. If a package is truly necessary, warn the user first.";

/// Git coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Watcher polling period in milliseconds
    pub watch_interval_ms: u64,

    /// Branch new branches are created from
    pub main_branch: String,

    /// Number of branches returned by `list_branches`
    pub recent_branch_limit: usize,

    /// Query `gh` for pull-request status
    pub pr_lookup: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            watch_interval_ms: 2000,
            main_branch: "main".to_string(),
            recent_branch_limit: 20,
            pr_lookup: true,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: BrokerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file location (`~/.config/airdock/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|p| p.join("airdock").join("config.toml"))
    }

    /// Reject values the broker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.git.watch_interval_ms == 0 {
            return Err(Error::Config(
                "git.watch_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.project.session_file.trim().is_empty() {
            return Err(Error::Config("project.session_file is empty".to_string()));
        }
        if self.project.image_dir.trim().is_empty() {
            return Err(Error::Config("project.image_dir is empty".to_string()));
        }
        if let Some(secret) = &self.server.secret {
            if secret.is_empty() {
                return Err(Error::Config("server.secret must not be empty".to_string()));
            }
        }
        Ok(())
    }
}
