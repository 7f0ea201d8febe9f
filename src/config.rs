use crate::aggregation::{DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_TIMELINE_MONTHS};
use crate::cache::{CacheConfig, DEFAULT_CHECK_PERIOD_SECS, DEFAULT_TTL_SECS};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}={value:?} is not a valid value")]
    Invalid { name: &'static str, value: String },
    #[error("{name} must be greater than zero")]
    NotPositive { name: &'static str },
}

// Configuration du serveur, lue depuis l'environnement avec des valeurs par défaut.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_file: String,
    pub port: u16,
    pub cache: CacheConfig,
    // TTL propre à la route des agrégats.
    pub aggregates_ttl: Duration,
    pub default_timeline_months: u32,
    pub query_timeout: Duration,
    pub seed_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_file: ":memory:".to_string(),
            port: 5000,
            cache: CacheConfig::default(),
            aggregates_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            default_timeline_months: DEFAULT_TIMELINE_MONTHS,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            seed_file: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_keys = match lookup("CACHE_MAX_KEYS") {
            Some(raw) => Some(parse_value("CACHE_MAX_KEYS", &raw)?),
            None => defaults.cache.max_keys,
        };

        Ok(Self {
            database_file: lookup("DATABASE_FILE").unwrap_or(defaults.database_file),
            port: parse_or("PORT", &lookup, defaults.port)?,
            cache: CacheConfig {
                default_ttl: seconds("CACHE_TTL_SECS", &lookup, DEFAULT_TTL_SECS)?,
                check_period: seconds(
                    "CACHE_CHECK_PERIOD_SECS",
                    &lookup,
                    DEFAULT_CHECK_PERIOD_SECS,
                )?,
                max_keys,
            },
            aggregates_ttl: seconds("AGGREGATES_TTL_SECS", &lookup, DEFAULT_TTL_SECS)?,
            default_timeline_months: positive(
                "DEFAULT_TIMELINE_MONTHS",
                parse_or("DEFAULT_TIMELINE_MONTHS", &lookup, DEFAULT_TIMELINE_MONTHS)?,
            )?,
            query_timeout: seconds("QUERY_TIMEOUT_SECS", &lookup, DEFAULT_QUERY_TIMEOUT_SECS)?,
            seed_file: lookup("SEED_FILE")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse_value<T: FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: raw.to_string(),
    })
}

fn parse_or<T, F>(name: &'static str, lookup: &F, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}

fn positive(name: &'static str, value: u32) -> Result<u32, ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive { name });
    }
    Ok(value)
}

fn seconds<F>(name: &'static str, lookup: &F, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(name, lookup, default)?;
    if secs == 0 {
        return Err(ConfigError::NotPositive { name });
    }
    Ok(Duration::from_secs(secs))
}
