//! Configuration for the statehost runtime.
//!
//! Supports YAML file and environment variable overrides.

use serde::Deserialize;
use std::path::Path;

/// Environment variable controlling the log filter.
pub const LOG_ENV_VAR: &str = "STATEHOST_LOG";

/// Default filename of the compiled descriptor set.
pub const DEFAULT_DESCRIPTOR_SET: &str = "user-function.desc";

/// Runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the compiled descriptor set covering the user's services.
    pub descriptor_set_path: String,
    /// Service identity advertised during discovery.
    pub service: ServiceConfig,
    /// gRPC listen endpoint.
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            descriptor_set_path: DEFAULT_DESCRIPTOR_SET.to_string(),
            service: ServiceConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Service identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Name advertised to the proxy.
    pub name: String,
    /// Version advertised to the proxy.
    pub version: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to. 0 binds an ephemeral port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("STATEHOST_CONFIG").unwrap_or_else(|_| "statehost.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STATEHOST_DESCRIPTOR_SET") {
            self.descriptor_set_path = path;
        }

        if let Ok(name) = std::env::var("STATEHOST_SERVICE_NAME") {
            self.service.name = name;
        }

        if let Ok(version) = std::env::var("STATEHOST_SERVICE_VERSION") {
            self.service.version = version;
        }

        if let Ok(host) = std::env::var("STATEHOST_HOST") {
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("STATEHOST_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
    }

    /// Get the socket address string for the server bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}
