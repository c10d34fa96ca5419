//! Connection configuration.
//!
//! A [`Config`] is built once at startup, either programmatically or from the
//! process environment, and copied into every transaction opened from the
//! [`Connection`](crate::Connection) it configures.

use crate::error::{Error, Result};
use std::time::Duration;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Metadata attached to every span the tracer opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceMeta {
    /// `db.system`, e.g. `mysql`, `postgresql`, `sqlite`
    pub system: String,
    /// `db.name`, empty when the URL carries no database
    pub database: String,
}

impl TraceMeta {
    /// Derives the metadata from a connection URL.
    pub fn from_url(url: &str) -> Self {
        let (scheme, rest) = url.split_once(':').unwrap_or(("", url));
        let system = match scheme {
            "postgres" | "postgresql" => "postgresql",
            "mysql" | "mariadb" => "mysql",
            "sqlite" => "sqlite",
            other => other,
        }
        .to_string();

        let path = rest.trim_start_matches("//");
        let database = match system.as_str() {
            "sqlite" => path.to_string(),
            _ => path
                .split_once('/')
                .map(|(_, db)| db.split('?').next().unwrap_or_default().to_string())
                .unwrap_or_default(),
        };

        Self { system, database }
    }
}

/// Adapter configuration: pool sizing, the per-operation timeout and tracing metadata.
#[derive(Debug, Clone)]
pub struct Config {
    pub url: String,
    /// Per-operation timeout. `Duration::ZERO` disables the deadline.
    pub timeout: Duration,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub trace: TraceMeta,
}

impl Config {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let trace = TraceMeta::from_url(&url);
        Self {
            url,
            timeout: Duration::ZERO,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 0,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            trace,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Reads the configuration from the process environment.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `DATABASE_URL` | required |
    /// | `DATABASE_TIMEOUT_MS` | `0` (no deadline) |
    /// | `DATABASE_MAX_CONNECTIONS` | `10` |
    /// | `DATABASE_MIN_CONNECTIONS` | `0` |
    /// | `DATABASE_ACQUIRE_TIMEOUT_MS` | `30000` |
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `DATABASE_URL` is unset or a numeric variable
    /// does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup("DATABASE_URL")
            .ok_or_else(|| Error::Config("DATABASE_URL is not set".to_string()))?;
        let mut config = Config::new(url);

        if let Some(ms) = parse::<u64>(&lookup, "DATABASE_TIMEOUT_MS")? {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(max) = parse::<u32>(&lookup, "DATABASE_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(min) = parse::<u32>(&lookup, "DATABASE_MIN_CONNECTIONS")? {
            config.min_connections = min;
        }
        if let Some(ms) = parse::<u64>(&lookup, "DATABASE_ACQUIRE_TIMEOUT_MS")? {
            config.acquire_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} is not a valid number: {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn trace_meta_from_urls() {
        let pg = TraceMeta::from_url("postgres://user:pw@localhost:5432/app?sslmode=disable");
        assert_eq!(pg.system, "postgresql");
        assert_eq!(pg.database, "app");

        let my = TraceMeta::from_url("mysql://localhost/test");
        assert_eq!(my.system, "mysql");
        assert_eq!(my.database, "test");

        let lite = TraceMeta::from_url("sqlite::memory:");
        assert_eq!(lite.system, "sqlite");
        assert_eq!(lite.database, ":memory:");
    }

    #[test]
    fn from_env_reads_all_variables() {
        let config = Config::from_lookup(env(&[
            ("DATABASE_URL", "mysql://localhost/test"),
            ("DATABASE_TIMEOUT_MS", "250"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
            ("DATABASE_MIN_CONNECTIONS", "1"),
        ]))
        .unwrap();

        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.acquire_timeout, DEFAULT_ACQUIRE_TIMEOUT);
    }

    #[test]
    fn from_env_requires_url() {
        let err = Config::from_lookup(env(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn from_env_rejects_garbage() {
        let err = Config::from_lookup(env(&[
            ("DATABASE_URL", "mysql://localhost/test"),
            ("DATABASE_TIMEOUT_MS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("DATABASE_TIMEOUT_MS"));
    }

    #[test]
    fn validate_checks_pool_bounds() {
        let config = Config::new("sqlite::memory:")
            .with_max_connections(1)
            .with_min_connections(2);
        assert!(config.validate().is_err());
    }
}
