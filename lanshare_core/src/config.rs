use anyhow::{Context, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "lanshare";
const APP_NAME: &str = "lanshare";
const CONFIG_FILE: &str = "config.json";

/// Overrides the config directory (tests, portable installs)
pub const CONFIG_DIR_ENV: &str = "LANSHARE_CONFIG_DIR";

/// Default accent colour, ARGB hex
pub const DEFAULT_ACCENT_COLOR: &str = "#FF0078D4";

/// Settings the core reads at the moment of use; written only by the settings owner
pub type SharedConfig = Arc<RwLock<AppConfig>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where received files are written
    pub save_dir: PathBuf,
    /// Outgoing ceiling in KB/s, 0 or less = unlimited
    pub upload_limit_kbps: i32,
    /// Incoming ceiling in KB/s, 0 or less = unlimited
    pub download_limit_kbps: i32,
    /// Display name; the host name when unset
    pub nickname: Option<String>,
    pub accent_color: String,
    pub avatar_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            save_dir: default_download_dir(),
            upload_limit_kbps: 0,
            download_limit_kbps: 0,
            nickname: None,
            accent_color: DEFAULT_ACCENT_COLOR.to_string(),
            avatar_path: None,
        }
    }
}

impl AppConfig {
    fn get_config_path() -> Option<PathBuf> {
        get_config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        let path = match Self::get_config_path() {
            Some(p) => p,
            None => return Self::default(),
        };

        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring corrupt config {:?}: {}", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::get_config_path().context("No config directory available")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}

/// Get the config directory path for this app
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// The user's Downloads folder, or `~/Downloads` when the platform has none
pub fn default_download_dir() -> PathBuf {
    UserDirs::new()
        .map(|dirs| {
            dirs.download_dir()
                .map(|d| d.to_path_buf())
                .unwrap_or_else(|| dirs.home_dir().join("Downloads"))
        })
        .unwrap_or_else(|| PathBuf::from(".").join("Downloads"))
}
