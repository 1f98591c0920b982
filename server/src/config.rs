//! Configuration management for the server.

use std::env;
use std::time::Duration;

use crate::backoff::Backoff;

/// Which backing store the server talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// PostgreSQL, with a LISTEN/NOTIFY change feed
    Postgres,
    /// In-process store, for local development
    Memory,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Backing store kind
    pub store: StoreKind,
    /// PostgreSQL connection URL, required for [`StoreKind::Postgres`]
    pub database_url: Option<String>,
    /// How long a backing-store call may take before it counts as failed
    pub write_timeout: Duration,
    /// Reconnect delays for change-feed subscriptions
    pub feed_backoff: Backoff,
    /// Consecutive feed failures before a collection is reported stale
    pub stale_after_failures: u32,
    /// Payload field carrying a create's operation id, if any
    pub correlation_field: Option<String>,
    /// Courts shown on the court board
    pub courts: Vec<i64>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Load configuration from any variable lookup.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = var("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let store = match var("COURTSIDE_STORE").as_deref() {
            None | Some("postgres") => StoreKind::Postgres,
            Some("memory") => StoreKind::Memory,
            Some(other) => return Err(ConfigError::UnknownStore(other.to_string())),
        };

        let database_url = var("DATABASE_URL");
        if store == StoreKind::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        let write_timeout = Duration::from_millis(number(&var, "WRITE_TIMEOUT_MS", 5000)?);
        let feed_backoff = Backoff::new(
            Duration::from_millis(number(&var, "FEED_BACKOFF_BASE_MS", 500)?),
            Duration::from_millis(number(&var, "FEED_BACKOFF_MAX_MS", 30_000)?),
        );
        let stale_after_failures = number(&var, "STALE_AFTER_FAILURES", 3)?;

        let correlation_field = match var("CORRELATION_FIELD") {
            None => Some("client_op_id".to_string()),
            Some(field) if field.trim().is_empty() => None,
            Some(field) => Some(field.trim().to_string()),
        };

        let courts = match var("COURTS") {
            None => vec![1, 2, 3],
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|court| !court.is_empty())
                .map(|court| {
                    court.parse().map_err(|_| ConfigError::InvalidValue {
                        name: "COURTS",
                        value: list.clone(),
                    })
                })
                .collect::<Result<_, _>>()?,
        };

        Ok(Self {
            host,
            port,
            store,
            database_url,
            write_timeout,
            feed_backoff,
            stale_after_failures,
            correlation_field,
            courts,
        })
    }
}

fn number<F, T>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match var(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Unknown COURTSIDE_STORE '{0}', expected postgres or memory")]
    UnknownStore(String),

    #[error("Invalid {name} value '{value}'")]
    InvalidValue { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/courtside")]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.store, StoreKind::Postgres);
        assert_eq!(config.write_timeout, Duration::from_secs(5));
        assert_eq!(config.stale_after_failures, 3);
        assert_eq!(config.correlation_field.as_deref(), Some("client_op_id"));
        assert_eq!(config.courts, vec![1, 2, 3]);
    }

    #[test]
    fn test_postgres_requires_database_url() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingDatabaseUrl)));
        assert!(load(&[("COURTSIDE_STORE", "memory")]).is_ok());
    }

    #[test]
    fn test_invalid_values() {
        let memory = ("COURTSIDE_STORE", "memory");
        assert!(matches!(
            load(&[memory, ("PORT", "eighty")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            load(&[memory, ("WRITE_TIMEOUT_MS", "-1")]),
            Err(ConfigError::InvalidValue { name: "WRITE_TIMEOUT_MS", .. })
        ));
        assert!(matches!(
            load(&[memory, ("COURTS", "1,two")]),
            Err(ConfigError::InvalidValue { name: "COURTS", .. })
        ));
        assert!(matches!(
            load(&[("COURTSIDE_STORE", "sqlite")]),
            Err(ConfigError::UnknownStore(_))
        ));
    }

    #[test]
    fn test_empty_correlation_field_disables() {
        let config = load(&[("COURTSIDE_STORE", "memory"), ("CORRELATION_FIELD", " ")]).unwrap();
        assert_eq!(config.correlation_field, None);
    }

    #[test]
    fn test_courts_list() {
        let config = load(&[("COURTSIDE_STORE", "memory"), ("COURTS", "4, 7,")]).unwrap();
        assert_eq!(config.courts, vec![4, 7]);
    }
}
