//! Per-user directories under `~/.speechport`.

use std::io;
use std::path::PathBuf;

/// Base directory name under the user's home.
pub const DEFAULT_BASE_DIR: &str = ".speechport";

/// Default configuration filename.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Directory layout for one speechport application.
#[derive(Debug, Clone)]
pub struct Paths {
    pub app_name: String,
    pub home_dir: PathBuf,
}

impl Paths {
    /// Resolves the layout for `app_name` under the current user's home.
    pub fn new(app_name: impl Into<String>) -> io::Result<Self> {
        let home_dir = dirs::home_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "could not find home directory")
        })?;
        Ok(Self::with_home(app_name, home_dir))
    }

    /// Layout rooted at an explicit home directory.
    pub fn with_home(app_name: impl Into<String>, home_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_name: app_name.into(),
            home_dir: home_dir.into(),
        }
    }

    /// `~/.speechport`
    pub fn base_dir(&self) -> PathBuf {
        self.home_dir.join(DEFAULT_BASE_DIR)
    }

    /// `~/.speechport/<app>`
    pub fn app_dir(&self) -> PathBuf {
        self.base_dir().join(&self.app_name)
    }

    /// `~/.speechport/<app>/config.yaml`
    pub fn config_file(&self) -> PathBuf {
        self.app_dir().join(DEFAULT_CONFIG_FILE)
    }

    /// `~/.speechport/<app>/cache`
    pub fn cache_dir(&self) -> PathBuf {
        self.app_dir().join("cache")
    }

    /// `~/.speechport/<app>/cache/hub`, where downloaded models live.
    pub fn hub_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("hub")
    }
}
