//! Process configuration loaded from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `DATABASE_URL` | unset (in-memory stores) |
//! | `DATABASE_MAX_CONNECTIONS` | 10 |
//! | `ERP_DRIVER` | `simulated` |
//! | `ERP_BASE_URL`, `ERP_COMPANY`, `ERP_USERNAME`, `ERP_PASSWORD` | required for `http` |
//! | `ERP_REQUEST_TIMEOUT_SECS` | 30 |
//! | `ERP_RECONNECT_ATTEMPTS` | 3 |
//! | `ERP_RECONNECT_BASE_MS` | 500 |
//! | `SYNC_ENABLED` | true |
//! | `SYNC_INTERVAL_SECS` | 30 |
//! | `SYNC_MAX_RETRIES` | 5 |
//! | `SYNC_BATCH_SIZE` | 50 |
//! | `SYNC_MIRROR_STALENESS_SECS` | 300 |
//! | `LOG_FORMAT` | `json` |
//!
//! Unset variables fall back to their default; set-but-invalid ones are an error.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use packline_observability::LogFormat;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErpDriver {
    Http,
    Simulated,
}

impl FromStr for ErpDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ErpDriver::Http),
            "simulated" => Ok(ErpDriver::Simulated),
            other => Err(format!("unknown driver {other}, expected http or simulated")),
        }
    }
}

/// Login details for the session-based ERP.
#[derive(Clone, PartialEq, Eq)]
pub struct ErpCredentials {
    pub base_url: String,
    pub company: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ErpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErpCredentials")
            .field("base_url", &self.base_url)
            .field("company", &self.company)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErpConfig {
    pub driver: ErpDriver,
    /// Set when `driver` is `Http`.
    pub credentials: Option<ErpCredentials>,
    pub request_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
}

impl ErpConfig {
    /// Backoff for the connection manager's bounded reconnect loop.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.reconnect_attempts,
            self.reconnect_base_delay,
            self.reconnect_base_delay.saturating_mul(16),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub max_retries: u32,
    pub batch_size: usize,
    pub mirror_staleness: Duration,
    /// Spacing between retries of one operation.
    pub retry_policy: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            max_retries: 5,
            batch_size: 50,
            mirror_staleness: Duration::from_secs(300),
            retry_policy: RetryPolicy::exponential(5, Duration::from_secs(30), Duration::from_secs(30 * 60)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// `None` runs on in-memory stores.
    pub database: Option<DatabaseConfig>,
    pub erp: ErpConfig,
    pub scheduler: SchedulerConfig,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let database = match vars.get("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: vars.parse("DATABASE_MAX_CONNECTIONS", 10)?,
            }),
            None => None,
        };

        let driver: ErpDriver = vars.parse("ERP_DRIVER", ErpDriver::Simulated)?;
        let credentials = match driver {
            ErpDriver::Http => Some(ErpCredentials {
                base_url: vars.require("ERP_BASE_URL")?,
                company: vars.require("ERP_COMPANY")?,
                username: vars.require("ERP_USERNAME")?,
                password: vars.require("ERP_PASSWORD")?,
            }),
            ErpDriver::Simulated => None,
        };
        let erp = ErpConfig {
            driver,
            credentials,
            request_timeout: Duration::from_secs(vars.positive("ERP_REQUEST_TIMEOUT_SECS", 30)?),
            reconnect_attempts: vars.parse("ERP_RECONNECT_ATTEMPTS", 3)?,
            reconnect_base_delay: Duration::from_millis(vars.parse("ERP_RECONNECT_BASE_MS", 500)?),
        };

        let interval = Duration::from_secs(vars.positive("SYNC_INTERVAL_SECS", 30)?);
        let max_retries = vars.parse("SYNC_MAX_RETRIES", 5)?;
        let scheduler = SchedulerConfig {
            enabled: vars.parse("SYNC_ENABLED", true)?,
            interval,
            max_retries,
            batch_size: vars.positive("SYNC_BATCH_SIZE", 50)?,
            mirror_staleness: Duration::from_secs(vars.parse("SYNC_MIRROR_STALENESS_SECS", 300)?),
            retry_policy: RetryPolicy::exponential(max_retries, interval, interval.saturating_mul(60)),
        };

        Ok(Self {
            database,
            erp,
            scheduler,
            log_format: vars.parse("LOG_FORMAT", LogFormat::Json)?,
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn require(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name).ok_or(ConfigError::Missing(name))
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn positive<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(name, default)?;
        if value <= T::default() {
            return Err(ConfigError::Invalid {
                name,
                value: self.get(name).unwrap_or_default(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_run_in_memory_with_simulated_erp() {
        let config = load(&[]).unwrap();
        assert!(config.database.is_none());
        assert_eq!(config.erp.driver, ErpDriver::Simulated);
        assert!(config.erp.credentials.is_none());
        assert_eq!(config.erp.reconnect_attempts, 3);
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.interval, Duration::from_secs(30));
        assert_eq!(config.scheduler.max_retries, 5);
        assert_eq!(config.scheduler.batch_size, 50);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn http_driver_requires_credentials() {
        let err = load(&[("ERP_DRIVER", "http"), ("ERP_BASE_URL", "https://erp:50000/b1s/v1")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("ERP_COMPANY"));

        let config = load(&[
            ("ERP_DRIVER", "HTTP"),
            ("ERP_BASE_URL", "https://erp:50000/b1s/v1"),
            ("ERP_COMPANY", "ACME"),
            ("ERP_USERNAME", "sync"),
            ("ERP_PASSWORD", "secret"),
        ])
        .unwrap();
        let creds = config.erp.credentials.unwrap();
        assert_eq!(creds.company, "ACME");
        assert!(!format!("{creds:?}").contains("secret"));
    }

    #[test]
    fn invalid_values_are_rejected_not_defaulted() {
        assert!(matches!(
            load(&[("SYNC_INTERVAL_SECS", "soon")]),
            Err(ConfigError::Invalid { name: "SYNC_INTERVAL_SECS", .. })
        ));
        assert!(matches!(
            load(&[("SYNC_BATCH_SIZE", "0")]),
            Err(ConfigError::Invalid { name: "SYNC_BATCH_SIZE", .. })
        ));
        assert!(matches!(
            load(&[("SYNC_ENABLED", "maybe")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(load(&[("ERP_DRIVER", "soap")]).is_err());
        assert!(load(&[("LOG_FORMAT", "xml")]).is_err());
    }

    #[test]
    fn database_url_enables_postgres() {
        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/packline"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
            ("SYNC_ENABLED", "false"),
            ("LOG_FORMAT", "pretty"),
        ])
        .unwrap();
        let db = config.database.unwrap();
        assert_eq!(db.max_connections, 4);
        assert!(!config.scheduler.enabled);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }
}
