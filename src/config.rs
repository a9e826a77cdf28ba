use crate::domains::route_tracking::{Coordinate, ObserverSettings};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `ROUTE_TRACKER__TRACKING__TICK_INTERVAL_MS=250`.
pub const ENV_PREFIX: &str = "ROUTE_TRACKER";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracking: TrackingConfig,
    pub observer: ObserverConfig,
    pub routing: RoutingConfig,
    pub store: StoreConfig,
    pub postgres: PostgresConfig,
    pub logging: LoggingConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingProvider {
    Interpolated,
    Geojson,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub provider: RoutingProvider,
    /// Waypoints per route for the interpolated provider, endpoints included.
    pub waypoints: usize,
    pub geojson_path: Option<String>,
    pub endpoint_tolerance_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Change feed polling period for the PostgreSQL backend.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: String,
    /// `tracing` filter used when `RUST_LOG` is unset; also the file log level.
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub driver_id: String,
    pub start: [f64; 2],
    pub end: [f64; 2],
}

impl Config {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then `path` if it exists, then `ROUTE_TRACKER__*` variables.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let defaults = ::config::Config::try_from(&Config::default())
            .context("Failed to serialize default configuration")?;
        let loaded: Config = ::config::Config::builder()
            .add_source(defaults)
            .add_source(::config::File::from(path.as_ref()).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tracking.tick_interval_ms == 0 {
            return Err(anyhow!("tracking.tick_interval_ms must be positive"));
        }
        if self.observer.reconnect_attempts == 0 {
            return Err(anyhow!("observer.reconnect_attempts must be at least 1"));
        }
        if self.observer.max_backoff_ms < self.observer.reconnect_backoff_ms {
            return Err(anyhow!("observer.max_backoff_ms must not be below reconnect_backoff_ms"));
        }
        match self.routing.provider {
            RoutingProvider::Interpolated if self.routing.waypoints < 2 => {
                Err(anyhow!("routing.waypoints must be at least 2"))
            }
            RoutingProvider::Geojson if self.routing.geojson_path.is_none() => {
                Err(anyhow!("routing.geojson_path is required for the geojson provider"))
            }
            _ => Ok(()),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tracking.tick_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.store.poll_interval_ms)
    }

    pub fn observer_settings(&self) -> ObserverSettings {
        ObserverSettings {
            reconnect_attempts: self.observer.reconnect_attempts,
            reconnect_backoff: Duration::from_millis(self.observer.reconnect_backoff_ms),
            max_backoff: Duration::from_millis(self.observer.max_backoff_ms),
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.logging.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl DemoConfig {
    pub fn endpoints(&self) -> Result<(Coordinate, Coordinate)> {
        let start = Coordinate::new(self.start[0], self.start[1])?;
        let end = Coordinate::new(self.end[0], self.end[1])?;
        Ok((start, end))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracking: TrackingConfig::default(),
            observer: ObserverConfig::default(),
            routing: RoutingConfig::default(),
            store: StoreConfig::default(),
            postgres: PostgresConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "route_tracker".to_string(),
                username: "postgres".to_string(),
                password: "password".to_string(),
                max_connections: 10,
            },
            logging: LoggingConfig::default(),
            demo: DemoConfig::default(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self { tick_interval_ms: 1000 }
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 5,
            reconnect_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            provider: RoutingProvider::Interpolated,
            waypoints: 5,
            geojson_path: None,
            endpoint_tolerance_m: 50.0,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            poll_interval_ms: 250,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: "logs/route-tracker.log".to_string(),
            level: "info".to_string(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            driver_id: "driver-1".to_string(),
            start: [28.6139, 77.2090],
            end: [28.7041, 77.1025],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const PARTIAL: &str = r#"
[tracking]
tick_interval_ms = 250

[routing]
provider = "interpolated"
waypoints = 8

[store]
backend = "memory"
"#;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.observer_settings(), ObserverSettings::default());
        assert!(config.demo.endpoints().is_ok());
    }

    #[tokio::test]
    async fn test_from_file_fills_missing_sections() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(PARTIAL.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).await.unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(250));
        assert_eq!(config.routing.waypoints, 8);
        assert_eq!(config.observer.reconnect_attempts, 5);
        assert_eq!(config.postgres.port, 5432);
    }

    #[test]
    fn test_load_layers_file_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(PARTIAL.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.tracking.tick_interval_ms, 250);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_geojson_provider_needs_a_route_file() {
        let mut config = Config::default();
        config.routing.provider = RoutingProvider::Geojson;
        assert!(config.validate().is_err());
        config.routing.geojson_path = Some("routes.geojson".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_tick_interval_is_rejected() {
        let mut config = Config::default();
        config.tracking.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
