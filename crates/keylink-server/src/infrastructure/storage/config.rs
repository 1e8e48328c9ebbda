//! TOML-based configuration for the server application.
//!
//! Reads and writes [`ServerConfig`] to the platform-appropriate config
//! file:
//! - Windows:  `%APPDATA%\KeyLink\config.toml`
//! - Linux:    `~/.config/keylink/config.toml`
//! - macOS:    `~/Library/Application Support/KeyLink/config.toml`
//!
//! Fields annotated with `#[serde(default = "some_fn")]` use the return
//! value of `some_fn()` when absent from the TOML file, so the server runs
//! correctly on first start (before any file exists) and when upgrading
//! from an older file missing newer fields.
//!
//! The handshake's hard limits – the maximum hello-reply length and the
//! rate-limit window/threshold – are deliberately *not* configuration.
//! They are protocol- and abuse-protection constants; a misconfigured
//! server must not be able to disable them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: GeneralConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
}

/// General server behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Display name shown to connecting clients' users.
    #[serde(default = "default_server_name")]
    pub name: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Network port and bind-address settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// TCP port clients connect to.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// IP address to bind to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Handshake timing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeConfig {
    /// Seconds a pending client has to complete the handshake before the
    /// session times out.
    #[serde(default = "default_handshake_timeout_secs")]
    pub timeout_secs: f64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_server_name() -> String {
    "keylink-server".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_control_port() -> u16 {
    24800
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_handshake_timeout_secs() -> f64 {
    30.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: GeneralConfig::default(),
            network: NetworkConfig::default(),
            handshake: HandshakeConfig::default(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            control_port: default_control_port(),
            bind_address: default_bind_address(),
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config
/// base directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory
/// cannot be determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads [`ServerConfig`] from disk, returning `ServerConfig::default()`
/// if the file does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not
/// found", and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config() -> Result<ServerConfig, ConfigError> {
    let path = config_file_path()?;

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let cfg: ServerConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Persists `config` to disk, creating the config directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &ServerConfig) -> Result<(), ConfigError> {
    let path = config_file_path()?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

/// Resolves the platform config base directory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("KeyLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("keylink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("KeyLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
