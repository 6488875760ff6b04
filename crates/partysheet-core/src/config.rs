// Configuration loading and parsing (partysheet.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// The configuration shipped with the crate; also the source of defaults.
pub const DEFAULT_CONFIG: &str = include_str!("../config/partysheet.toml");

const CONFIG_FILE_NAME: &str = "partysheet.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub server: ServerConfig,
    pub notices: NoticeConfig,
    pub channels: ChannelConfig,
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub lobby_url: Url,
    pub api_url: Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct NoticeConfig {
    pub authorization_ttl_ms: u64,
    pub action_ttl_ms: u64,
}

impl NoticeConfig {
    pub fn authorization_ttl(&self) -> Duration {
        Duration::from_millis(self.authorization_ttl_ms)
    }

    pub fn action_ttl(&self) -> Duration {
        Duration::from_millis(self.action_ttl_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ChannelConfig {
    pub event_capacity: usize,
    pub update_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ChatConfig {
    pub transcript_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                lobby_url: Url::parse("ws://localhost:8000/ws/lobby")
                    .expect("default lobby URL is valid"),
                api_url: Url::parse("http://localhost:8000/api/")
                    .expect("default API URL is valid"),
            },
            notices: NoticeConfig {
                authorization_ttl_ms: 3000,
                action_ttl_ms: 4000,
            },
            channels: ChannelConfig {
                event_capacity: 256,
                update_capacity: 256,
            },
            chat: ChatConfig {
                transcript_limit: 200,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Raw file structs
// ---------------------------------------------------------------------------

/// Raw deserialization target. Every section is optional and falls back to
/// the defaults of [`Config::default`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    server: Option<ServerSection>,
    notices: Option<NoticeConfig>,
    channels: Option<ChannelConfig>,
    chat: Option<ChatConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerSection {
    lobby_url: Option<String>,
    api_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Parse and validate configuration text. `path` is only used in errors.
pub fn parse_config(text: &str, path: &Path) -> Result<Config, ConfigError> {
    let file: ConfigFile = toml::from_str(text).map_err(|source| ConfigError::ParseError {
        path: path.to_path_buf(),
        source,
    })?;

    let defaults = Config::default();
    let server = match file.server {
        Some(section) => ServerConfig {
            lobby_url: match section.lobby_url {
                Some(raw) => parse_url("server.lobby_url", &raw, &["ws", "wss"])?,
                None => defaults.server.lobby_url,
            },
            api_url: match section.api_url {
                Some(raw) => parse_url("server.api_url", &raw, &["http", "https"])?,
                None => defaults.server.api_url,
            },
        },
        None => defaults.server,
    };

    let config = Config {
        server,
        notices: file.notices.unwrap_or(defaults.notices),
        channels: file.channels.unwrap_or(defaults.channels),
        chat: file.chat.unwrap_or(defaults.chat),
    };
    validate(&config)?;
    Ok(config)
}

/// Load and validate the configuration file at `path`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let text = read_file(path)?;
    parse_config(&text, path)
}

/// Load `partysheet.toml` from the platform config directory, falling back
/// to the defaults when no file exists there.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_or_default(default_config_path().as_deref())
}

/// Load `path` if it names an existing file, otherwise use the defaults.
pub fn load_config_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) if path.exists() => load_config_from(path),
        _ => Ok(Config::default()),
    }
}

/// Platform config location, e.g. `~/.config/partysheet/partysheet.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "partysheet")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::ReadError {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn parse_url(field: &str, raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::ValidationError {
        field: field.into(),
        message: format!("invalid URL `{raw}`: {e}"),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::ValidationError {
            field: field.into(),
            message: format!("scheme must be one of {schemes:?}, got `{}`", url.scheme()),
        });
    }
    Ok(url)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let checks = [
        ("notices.authorization_ttl_ms", config.notices.authorization_ttl_ms),
        ("notices.action_ttl_ms", config.notices.action_ttl_ms),
        ("channels.event_capacity", config.channels.event_capacity as u64),
        ("channels.update_capacity", config.channels.update_capacity as u64),
        ("chat.transcript_limit", config.chat.transcript_limit as u64),
    ];
    for (field, value) in checks {
        if value == 0 {
            return Err(ConfigError::ValidationError {
                field: field.into(),
                message: "must be greater than zero".into(),
            });
        }
    }
    Ok(())
}
