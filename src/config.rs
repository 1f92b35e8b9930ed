use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config directory not found")]
    NoConfigDir,
    #[error("config file not found at {0}")]
    NotFound(PathBuf),
    #[error("failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub debrid: DebridConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibraryConfig {
    /// Start the next episode automatically once the current one ends
    #[serde(default = "default_true")]
    pub auto_play_next_episode: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            auto_play_next_episode: true,
        }
    }
}

/// Local player used for downloaded files. When `command` is unset the
/// server's own media player integration is used instead.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Default, Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub state_file: Option<PathBuf>,
}

impl StorageConfig {
    pub fn state_file(&self) -> Option<PathBuf> {
        self.state_file.clone().or_else(|| {
            ProjectDirs::from("", "", "nextup").map(|dirs| dirs.data_dir().join("state.json"))
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebridConfig {
    /// Let the server pick the stream for every episode of a debrid session
    #[serde(default)]
    pub auto_select_file: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;
        config.validate()?;
        config.server.url = config.server.url.trim_end_matches('/').to_string();
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("", "", "nextup")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.url.is_empty() {
            return Err(ConfigError::ValidationError(
                "server.url cannot be empty".to_string(),
            ));
        }

        if url::Url::parse(&self.server.url).is_err()
            || !(self.server.url.starts_with("http://") || self.server.url.starts_with("https://"))
        {
            return Err(ConfigError::ValidationError(
                "server.url must start with http:// or https://".to_string(),
            ));
        }

        if let Some(command) = &self.player.command
            && command.trim().is_empty()
        {
            return Err(ConfigError::ValidationError(
                "player.command cannot be blank".to_string(),
            ));
        }

        Ok(())
    }
}
