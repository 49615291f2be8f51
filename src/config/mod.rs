//! Configuration management for meshconn.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::link::{LinkConfig, NodeIdentity};
use crate::manager::ManagerConfig;
use crate::probe::ProbeConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Local node identity.
    #[serde(default)]
    pub node: NodeIdentity,

    /// Mesh session configuration.
    #[serde(default)]
    pub link: LinkConfig,

    /// Endpoint racing configuration.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Multi-transport manager configuration.
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            return Err(Error::InvalidConfig("node.node_id must not be empty".into()));
        }

        let durations = [
            ("link.connect_timeout", self.link.connect_timeout),
            ("link.join_timeout", self.link.join_timeout),
            ("probe.round_timeout", self.probe.round_timeout),
            ("probe.probe_timeout", self.probe.probe_timeout),
            ("probe.reprobe_interval", self.probe.reprobe_interval),
            ("manager.health_interval", self.manager.health_interval),
            ("manager.ping_timeout", self.manager.ping_timeout),
            ("manager.connect_timeout", self.manager.connect_timeout),
            ("manager.reconnect.base_delay", self.manager.reconnect.base_delay),
            ("manager.transport.connect_timeout", self.manager.transport.connect_timeout),
            ("manager.transport.ping_timeout", self.manager.transport.ping_timeout),
        ];
        for (name, value) in durations {
            if value == Duration::ZERO {
                return Err(Error::InvalidConfig(format!("{name} must be greater than zero")));
            }
        }

        if self.manager.failure_threshold == 0 {
            return Err(Error::InvalidConfig(
                "manager.failure_threshold must be at least 1".into(),
            ));
        }

        let reconnect = &self.manager.reconnect;
        if reconnect.base_delay > reconnect.max_delay {
            return Err(Error::InvalidConfig(format!(
                "manager.reconnect.base_delay ({:?}) exceeds max_delay ({:?})",
                reconnect.base_delay, reconnect.max_delay
            )));
        }

        if !self.link.ws_path.starts_with('/') || !self.manager.transport.ws_path.starts_with('/') {
            return Err(Error::InvalidConfig("ws_path must start with '/'".into()));
        }

        if self.link.max_frame_size == 0 || self.manager.transport.max_frame_size == 0 {
            return Err(Error::InvalidConfig("max_frame_size must be greater than zero".into()));
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "meshconn", "meshconn").map_or_else(
            || PathBuf::from("meshconn.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            node: NodeIdentity::new("node-kitchen")
                .with_name("Kitchen tablet")
                .with_capabilities(["llm", "camera"]),
            ..Default::default()
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

impl LoggingConfig {
    /// Apply command-line overrides on top of the file's settings.
    pub fn with_overrides(mut self, level: Option<String>, no_color: bool) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if no_color {
            self.color = false;
        }
        self
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
