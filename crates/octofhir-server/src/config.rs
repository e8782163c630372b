//! Server configuration: `octofhir.toml` layered with `OCTOFHIR__*`
//! environment overrides.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use octofhir_subscriptions::SubscriptionSettings;
use octofhir_terminology::TerminologySettings;
use serde::{Deserialize, Serialize};

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub subscriptions: SubscriptionSettings,
    pub terminology: TerminologySettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        let level = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(format!(
                "logging.level must be one of {LOG_LEVELS:?}, got {:?}",
                self.logging.level
            ));
        }
        self.subscriptions.validate()?;
        self.terminology
            .validate()
            .map_err(|e| format!("terminology config error: {e}"))
    }

    /// Listen address; an unparseable host binds all interfaces.
    pub fn addr(&self) -> SocketAddr {
        let host = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(host, self.server.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body.
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8888,
            body_limit_bytes: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Ignored when `RUST_LOG` is set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// File (optional, defaults to `octofhir.toml`) then environment, e.g.
    /// `OCTOFHIR__SERVER__PORT=9090`. The merged result is validated.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let file = PathBuf::from(path.unwrap_or("octofhir.toml"));
        let merged = Config::builder()
            .add_source(File::from(file).required(false))
            .add_source(
                Environment::with_prefix("OCTOFHIR")
                    .try_parsing(true)
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize::<AppConfig>())
            .map_err(|e| format!("invalid configuration: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
