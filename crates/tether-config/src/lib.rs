//! Layered TOML configuration for Tether.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > project > global > defaults

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tether_mcp::{ClientConfig, ServerDefinition, Timeouts};
use thiserror::Error;

/// Environment variable that overrides `mcp.enabled`.
pub const ENABLED_ENV_VAR: &str = "TETHER_MCP_ENABLED";

/// Environment variable that relocates the global config directory.
pub const CONFIG_DIR_ENV_VAR: &str = "TETHER_CONFIG_DIR";

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("MCP server '{name}' is defined more than once")]
    DuplicateServer { name: String },
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub mcp: McpSettings,
}

/// The `[mcp]` section of a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpSettings {
    pub enabled: Option<bool>,
    #[serde(default)]
    pub servers: Vec<ServerDefinition>,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutSettings {
    pub handshake_ms: Option<u64>,
    pub discovery_ms: Option<u64>,
    pub call_ms: Option<u64>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Use exactly this file instead of the global and project files.
    pub config_file: Option<PathBuf>,
    pub enabled: Option<bool>,
}

/// Load configuration from all sources, applying precedence rules.
///
/// Precedence (highest to lowest):
/// 1. CLI flags
/// 2. Environment variables
/// 3. Project config (./.tether/config.toml)
/// 4. Global config (~/.tether/config.toml)
/// 5. Defaults
pub fn load(overrides: CliOverrides) -> Result<ClientConfig, ConfigError> {
    let layers = match &overrides.config_file {
        Some(path) => vec![read_settings_file(path)?],
        None => {
            let mut layers = vec![load_settings_file(&config_dir().join("config.toml"))];
            if let Some(project) = project_config_path() {
                layers.push(load_settings_file(&project));
            }
            layers
        }
    };

    let env_enabled = match std::env::var(ENABLED_ENV_VAR) {
        Ok(value) => Some(parse_flag(ENABLED_ENV_VAR, &value)?),
        Err(_) => None,
    };

    resolve(layers, env_enabled, overrides.enabled)
}

/// Merge settings layers (lowest precedence first) into a client config.
///
/// Later layers replace servers with the same name; a name repeated within a
/// single layer is an error.
pub fn resolve(
    layers: Vec<SettingsFile>,
    env_enabled: Option<bool>,
    cli_enabled: Option<bool>,
) -> Result<ClientConfig, ConfigError> {
    let mut enabled = false;
    let mut servers: Vec<ServerDefinition> = Vec::new();
    let mut timeouts = Timeouts::default();

    for layer in layers {
        let mcp = layer.mcp;
        if let Some(flag) = mcp.enabled {
            enabled = flag;
        }

        let mut seen = HashSet::new();
        for server in mcp.servers {
            if !seen.insert(server.name.clone()) {
                return Err(ConfigError::DuplicateServer { name: server.name });
            }
            match servers.iter_mut().find(|s| s.name == server.name) {
                Some(existing) => *existing = server,
                None => servers.push(server),
            }
        }

        if let Some(ms) = mcp.timeouts.handshake_ms {
            timeouts.handshake_ms = ms;
        }
        if let Some(ms) = mcp.timeouts.discovery_ms {
            timeouts.discovery_ms = ms;
        }
        if let Some(ms) = mcp.timeouts.call_ms {
            timeouts.call_ms = Some(ms);
        }
    }

    if let Some(flag) = env_enabled {
        enabled = flag;
    }
    if let Some(flag) = cli_enabled {
        enabled = flag;
    }

    for (key, ms) in [
        ("mcp.timeouts.handshake_ms", timeouts.handshake_ms),
        ("mcp.timeouts.discovery_ms", timeouts.discovery_ms),
    ] {
        if ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: key.into(),
                message: "must be greater than zero".into(),
            });
        }
    }

    Ok(ClientConfig {
        enabled,
        servers,
        timeouts,
    })
}

/// Parse a boolean flag from an environment variable value.
pub fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.into(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

/// Get the Tether config directory path (~/.tether/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV_VAR) {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

/// Project config in the current directory, if the directory is known.
fn project_config_path() -> Option<PathBuf> {
    std::env::current_dir()
        .ok()
        .map(|cwd| cwd.join(".tether").join("config.toml"))
}

/// Load and parse a TOML settings file, returning defaults on any error.
fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}

/// Load a settings file that must exist and parse.
pub fn read_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
