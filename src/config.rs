//! Configuration sources for the datasource subsystem
//!
//! Components never read the process environment themselves; they are handed
//! a [`ConfigProvider`]. The binary layers the environment over the
//! `[properties]` table of an optional `config.toml`.

use crate::{DataSourceError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Searched in order by [`Config::load`]
const CONFIG_PATHS: [&str; 3] = ["config.toml", "./config.toml", "config/config.toml"];

/// Read-only key/value lookup used by the resolver and the configurator
pub trait ConfigProvider: Send + Sync {
    /// Raw lookup; `None` when the key is not set
    fn get(&self, key: &str) -> Option<String>;

    /// Lookup that treats empty and whitespace-only values as absent.
    /// Present values are returned verbatim; passwords may carry spaces.
    fn get_non_empty(&self, key: &str) -> Option<String> {
        self.get(key).filter(|value| !value.trim().is_empty())
    }

    /// First non-empty value among `keys`, in order
    fn first_of(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.get_non_empty(key))
    }
}

/// Process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentProvider;

impl ConfigProvider for EnvironmentProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// In-memory key/value provider
#[derive(Debug, Clone, Default)]
pub struct MapProvider {
    values: HashMap<String, String>,
}

impl MapProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl From<HashMap<String, String>> for MapProvider {
    fn from(values: HashMap<String, String>) -> Self {
        Self { values }
    }
}

impl<const N: usize> From<[(&str, &str); N]> for MapProvider {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl ConfigProvider for MapProvider {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Ordered stack of providers; the first layer with a non-empty value wins
#[derive(Default)]
pub struct LayeredProvider {
    layers: Vec<Box<dyn ConfigProvider>>,
}

impl LayeredProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a lower-priority layer
    pub fn layer(mut self, provider: impl ConfigProvider + 'static) -> Self {
        self.layers.push(Box::new(provider));
        self
    }
}

impl ConfigProvider for LayeredProvider {
    fn get(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.get_non_empty(key))
    }
}

/// Complete process configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Connection properties consulted after the process environment
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Server configuration section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Status endpoint listening port
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(DataSourceError::configuration_error(
                path.display().to_string(),
                "Configuration file not found".to_string(),
            ));
        }

        let content = fs::read_to_string(path)
            .map_err(|e| DataSourceError::io_error(e, format!("reading {}", path.display())))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| {
            DataSourceError::configuration_error(
                "config.toml".to_string(),
                format!("Failed to parse configuration file: {}", e),
            )
        })?;

        config.validate()?;
        Ok(config)
    }

    /// First existing configuration file among the default locations
    pub fn find_config_file() -> Option<&'static str> {
        CONFIG_PATHS.into_iter().find(|path| Path::new(path).exists())
    }

    /// Load configuration with fallback to default file locations.
    ///
    /// Runs before logging is set up; callers report where it came from.
    pub fn load() -> Result<Self> {
        match Self::find_config_file() {
            Some(path) => Self::from_file(path),
            None => Self::from_provider(&EnvironmentProvider),
        }
    }

    /// Build server settings from `PORT` and `LOG_LEVEL`, with no file properties
    pub fn from_provider(provider: &dyn ConfigProvider) -> Result<Self> {
        let port = match provider.get_non_empty("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                DataSourceError::validation_error(
                    format!("Invalid PORT value: {}", raw),
                    Some("PORT must be a valid number between 1 and 65535".to_string()),
                )
            })?,
            None => default_server_port(),
        };
        let log_level = provider
            .get_non_empty("LOG_LEVEL")
            .unwrap_or_else(default_log_level);

        let config = Config {
            server: ServerConfig { port, log_level },
            properties: HashMap::new(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(DataSourceError::validation_error(
                "Server port cannot be 0".to_string(),
                Some("Use a port number between 1 and 65535".to_string()),
            ));
        }

        match self.server.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(DataSourceError::validation_error(
                    format!("Invalid log level: {}", self.server.log_level),
                    Some("Valid log levels: trace, debug, info, warn, error".to_string()),
                ));
            }
        }

        Ok(())
    }

    /// Provider used for connection resolution: environment first, then file properties
    pub fn provider(&self) -> LayeredProvider {
        LayeredProvider::new()
            .layer(EnvironmentProvider)
            .layer(MapProvider::from(self.properties.clone()))
    }

    /// Tracing level for the configured log level name
    pub fn tracing_level(&self) -> tracing::Level {
        match self.server.log_level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

fn default_server_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}
