use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub redis: RedisConfig,
    pub postgres: PostgresConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// Local fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Per-subscriber queue capacity; events beyond it are dropped for that subscriber
    pub channel_capacity: usize,
    /// Identity of this instance on the relay; generated when empty
    pub node_id: String,
    /// Events waiting to be published to the relay; overflow is dropped
    pub relay_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            node_id: String::new(),
            relay_queue_capacity: 1024,
        }
    }
}

/// Redis relay settings. An empty `url` runs the hub in single-node mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub channel: String,
    pub connect_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            channel: "data_changes".to_string(),
            connect_timeout_seconds: 5,
        }
    }
}

/// PostgreSQL change source settings. An empty `url` disables the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub url: String,
    pub notify_channel: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            notify_channel: "data_changes".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // CHANGEFEED_REDIS__URL, CHANGEFEED_HUB__CHANNEL_CAPACITY, ...
        builder = builder.add_source(
            Environment::with_prefix("CHANGEFEED")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Locate and load the configuration.
    ///
    /// Search order: `explicit`, `CHANGEFEED_CONFIG_PATH`, `./config.yaml`,
    /// `/config/config.yaml`, then environment variables only.
    pub fn discover(explicit: Option<&str>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(str::to_string)
            .or_else(|| std::env::var("CHANGEFEED_CONFIG_PATH").ok())
            .filter(|p| Path::new(p).exists())
            .or_else(|| {
                ["config.yaml", "/config/config.yaml"]
                    .into_iter()
                    .find(|p| Path::new(p).exists())
                    .map(str::to_string)
            });

        match path {
            Some(path) => Self::from_file(&path),
            None => Self::from_env(),
        }
    }

    /// Check the configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.hub.channel_capacity == 0 {
            errors.push("hub.channel_capacity must be greater than zero".to_string());
        }
        if self.hub.relay_queue_capacity == 0 {
            errors.push("hub.relay_queue_capacity must be greater than zero".to_string());
        }

        if !self.redis.url.is_empty() {
            match url::Url::parse(&self.redis.url) {
                Ok(url) if matches!(url.scheme(), "redis" | "rediss") => {}
                Ok(url) => errors.push(format!(
                    "redis.url has unsupported scheme '{}'",
                    url.scheme()
                )),
                Err(e) => errors.push(format!("redis.url is invalid: {e}")),
            }
            if self.redis.channel.trim().is_empty() {
                errors.push("redis.channel must not be empty".to_string());
            }
        }

        if !self.postgres.url.is_empty() {
            match url::Url::parse(&self.postgres.url) {
                Ok(url) if matches!(url.scheme(), "postgres" | "postgresql") => {}
                Ok(url) => errors.push(format!(
                    "postgres.url has unsupported scheme '{}'",
                    url.scheme()
                )),
                Err(e) => errors.push(format!("postgres.url is invalid: {e}")),
            }
            if self.postgres.notify_channel.trim().is_empty() {
                errors.push("postgres.notify_channel must not be empty".to_string());
            }
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn relay_enabled(&self) -> bool {
        !self.redis.url.is_empty()
    }

    #[must_use]
    pub fn source_enabled(&self) -> bool {
        !self.postgres.url.is_empty()
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}
