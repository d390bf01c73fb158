use std::{env, fmt::Display, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Secret {0} is not configured")]
    MissingSecret(String),

    #[error("Secret {0} is unusable: {1}")]
    InvalidSecret(String, String),
}

/// Where locks, votes, tickets and event flags live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Development only, nothing survives a restart.
    Memory,
    Redis(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backend: StoreBackend,
    pub ticket_base_url: String,
    pub device_limit: usize,
    pub device_window: Duration,
    pub ip_limit: usize,
    pub ip_window: Duration,
    pub lock_ttl: Duration,
    pub retention: Duration,
    pub code_digits: u32,
    pub max_code_attempts: u32,
    pub sweep_interval: Duration,
    pub dev_event: Option<i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            backend: StoreBackend::Memory,
            ticket_base_url: "http://localhost:5173".to_string(),
            device_limit: 5,
            device_window: Duration::from_secs(30),
            ip_limit: 40,
            ip_window: Duration::from_secs(10),
            lock_ttl: Duration::from_secs(60),
            retention: Duration::from_secs(48 * 60 * 60),
            code_digits: 4,
            max_code_attempts: 100,
            sweep_interval: Duration::from_secs(60),
            dev_event: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let backend = match try_load::<String>("VOTE_STORE", "redis")?.as_str() {
            "memory" => {
                warn!("Using the in-memory store, votes will not survive a restart");
                StoreBackend::Memory
            }
            "redis" => StoreBackend::Redis(try_load("REDIS_URL", "redis://redis:6379")?),
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "VOTE_STORE".to_string(),
                    reason: format!("unknown backend {other}"),
                });
            }
        };

        let dev_event = optional("VOTE_DEV_EVENT", env::var("VOTE_DEV_EVENT").ok())?;

        let config = Self {
            port: try_load("RUST_PORT", "8080")?,
            backend,
            ticket_base_url: try_load("TICKET_BASE_URL", "http://localhost:5173")?,
            device_limit: try_load("VOTE_DEVICE_LIMIT", "5")?,
            device_window: Duration::from_secs(try_load("VOTE_DEVICE_WINDOW_SECS", "30")?),
            ip_limit: try_load("VOTE_IP_LIMIT", "40")?,
            ip_window: Duration::from_secs(try_load("VOTE_IP_WINDOW_SECS", "10")?),
            lock_ttl: Duration::from_secs(try_load("FINGERPRINT_LOCK_TTL_SECS", "60")?),
            retention: Duration::from_secs(
                try_load::<u64>("FINGERPRINT_RETENTION_HOURS", "48")? * 60 * 60,
            ),
            code_digits: try_load("VOTE_CODE_DIGITS", "4")?,
            max_code_attempts: try_load("VOTE_CODE_MAX_ATTEMPTS", "100")?,
            sweep_interval: Duration::from_secs(try_load("SWEEP_INTERVAL_SECS", "60")?),
            dev_event,
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, reason: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if !(1..=18).contains(&self.code_digits) {
            return Err(invalid("VOTE_CODE_DIGITS", "must be between 1 and 18"));
        }
        if self.max_code_attempts == 0 {
            return Err(invalid("VOTE_CODE_MAX_ATTEMPTS", "must be positive"));
        }
        if self.device_limit == 0 || self.ip_limit == 0 {
            return Err(invalid("VOTE_*_LIMIT", "must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(invalid("SWEEP_INTERVAL_SECS", "must be positive"));
        }
        if let Err(e) = Url::parse(&self.ticket_base_url) {
            return Err(invalid("TICKET_BASE_URL", &e.to_string()));
        }

        Ok(())
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let raw = var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    parse(key, &raw)
}

/// Key without a default. Unset stays `None` and is not logged.
fn optional<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T::Err: Display,
{
    raw.map(|raw| parse(key, &raw)).transpose()
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    raw.trim().parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{Config, optional, parse};

    #[test]
    fn test_defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_digits_rejected() {
        let config = Config {
            code_digits: 0,
            ..Config::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ticket_base_url_must_parse() {
        let config = Config {
            ticket_base_url: "not a url".to_string(),
            ..Config::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_trims_and_reports_key() {
        assert_eq!(parse::<u16>("RUST_PORT", " 9000 ").unwrap(), 9000);

        let err = parse::<u16>("RUST_PORT", "port").unwrap_err();
        assert!(err.to_string().contains("RUST_PORT"));
    }

    #[test]
    fn test_optional_key() {
        assert_eq!(optional::<i64>("VOTE_DEV_EVENT", None).unwrap(), None);
        assert_eq!(
            optional::<i64>("VOTE_DEV_EVENT", Some(" 7 ".to_string())).unwrap(),
            Some(7)
        );
        assert!(optional::<i64>("VOTE_DEV_EVENT", Some("seven".to_string())).is_err());
    }
}
