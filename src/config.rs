//! Session file handling for `~/.gatorconfig.json`.
//!
//! The file holds the database location and the name of the logged-in user.
//! It must exist before any command runs; `login` and `register` rewrite it.
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the session file inside the home directory.
pub const CONFIG_FILE_NAME: &str = ".gatorconfig.json";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON in config file: {0}")]
    Parse(#[from] serde_json::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Failed to encode config: {0}")]
    Serialize(#[source] serde_json::Error),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Contents of the session file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database path or `sqlite:` URL.
    pub db_url: String,

    /// Logged-in user. An empty string counts as logged out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user_name: Option<String>,
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 2] = ["db_url", "current_user_name"];

    /// Read and parse the session file at `path`.
    ///
    /// - Missing file → `Err(ConfigError::Io)` with `NotFound`
    /// - Invalid JSON or missing `db_url` → `Err(ConfigError::Parse)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading to prevent memory exhaustion
        let meta = std::fs::metadata(path)?;
        if meta.len() > Self::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge(format!(
                "Config file is {} bytes (max {} bytes)",
                meta.len(),
                Self::MAX_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path)?;

        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&content)?;
        for key in raw.keys() {
            if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            }
        }

        let config: Config = serde_json::from_value(serde_json::Value::Object(raw))?;
        tracing::debug!(path = %path.display(), db_url = %config.db_url, "Loaded configuration");
        Ok(config)
    }

    /// Write the session file atomically: temp file, sync, rename.
    ///
    /// SEC-009: The temp file is created with `create_new`, so a pre-planted
    /// file or symlink at the temp path makes the write fail instead of being
    /// followed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let mut json = serde_json::to_vec_pretty(self).map_err(ConfigError::Serialize)?;
        json.push(b'\n');

        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(format!(".tmp.{:016x}", nanos));
        let temp_path = PathBuf::from(temp_name);

        let result = (|| {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
            std::fs::rename(&temp_path, path)
        })();

        if let Err(e) = result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(ConfigError::Io(e));
        }
        Ok(())
    }
}

/// `$HOME/.gatorconfig.json`, or `None` when `HOME` is unset.
pub fn default_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(CONFIG_FILE_NAME))
}

// ============================================================================
// Session
// ============================================================================

/// The loaded session file together with where it lives.
#[derive(Debug, Clone)]
pub struct Session {
    pub config: Config,
    path: PathBuf,
}

impl Session {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = Config::load(&path)?;
        Ok(Self { config, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn db_url(&self) -> &str {
        &self.config.db_url
    }

    pub fn current_user(&self) -> Option<&str> {
        self.config
            .current_user_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    /// Make `name` the current user and persist the change.
    ///
    /// The in-memory session only changes once the file is written.
    pub fn set_user(&mut self, name: &str) -> Result<(), ConfigError> {
        let mut updated = self.config.clone();
        updated.current_user_name = Some(name.to_string());
        updated.save(&self.path)?;
        self.config = updated;
        tracing::debug!(user = %name, path = %self.path.display(), "Session user updated");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
