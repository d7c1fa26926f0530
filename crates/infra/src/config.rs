//! Service configuration, loaded once at startup from environment variables.
//!
//! | Variable | Default | |
//! |----------|---------|-|
//! | `HTTP_ADDR` | `0.0.0.0:8080` | listen address; a bare `:port` binds every interface |
//! | `DATABASE_URL` | unset | Postgres URL; unset selects the in-memory backend |
//! | `DB_MIN_CONNECTIONS` | `1` | |
//! | `DB_MAX_CONNECTIONS` | `5` | |
//! | `DB_MAX_LIFETIME_SECS` | `1800` | max lifetime of a pooled connection |
//! | `MAX_LEDGER_ENTRIES` | `100` | entries allowed per transaction |
//! | `REQUEST_TIMEOUT_MS` | `5000` | deadline for the store work of a create |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use tally_ledger::LedgerLimits;

use crate::service::LedgerSettings;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Postgres connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub max_lifetime: Duration,
}

// The URL may carry credentials.
impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("max_lifetime", &self.max_lifetime)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub http_addr: SocketAddr,
    /// `None` runs against the in-memory backend.
    pub database: Option<DatabaseConfig>,
    pub max_ledger_entries: usize,
    pub request_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup (environment, map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let http_addr = match get("HTTP_ADDR") {
            Some(raw) => parse_http_addr(&raw)?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let database = match get("DATABASE_URL") {
            None => None,
            Some(url) => {
                let min_connections: u32 = parse_or(&get, "DB_MIN_CONNECTIONS", Some(1))?;
                let max_connections: u32 = parse_or(&get, "DB_MAX_CONNECTIONS", Some(5))?;
                if max_connections == 0 || min_connections > max_connections {
                    return Err(ConfigError::Invalid {
                        key: "DB_MAX_CONNECTIONS",
                        value: max_connections.to_string(),
                        reason: format!("must be at least 1 and >= DB_MIN_CONNECTIONS ({min_connections})"),
                    });
                }
                let lifetime_secs: u64 = parse_or(&get, "DB_MAX_LIFETIME_SECS", Some(1800))?;
                Some(DatabaseConfig {
                    url,
                    min_connections,
                    max_connections,
                    max_lifetime: Duration::from_secs(lifetime_secs),
                })
            }
        };

        let max_ledger_entries: usize = parse_or(&get, "MAX_LEDGER_ENTRIES", Some(100))?;
        if max_ledger_entries < tally_ledger::validation::MIN_ENTRIES {
            return Err(ConfigError::Invalid {
                key: "MAX_LEDGER_ENTRIES",
                value: max_ledger_entries.to_string(),
                reason: format!("must be at least {}", tally_ledger::validation::MIN_ENTRIES),
            });
        }

        let timeout_ms: u64 = parse_or(&get, "REQUEST_TIMEOUT_MS", Some(5000))?;
        if timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "REQUEST_TIMEOUT_MS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(Self {
            http_addr,
            database,
            max_ledger_entries,
            request_timeout: Duration::from_millis(timeout_ms),
        })
    }

    /// Settings for [`LedgerService`](crate::service::LedgerService).
    pub fn ledger_settings(&self) -> LedgerSettings {
        LedgerSettings {
            limits: LedgerLimits {
                max_entries: self.max_ledger_entries,
                ..LedgerLimits::default()
            },
            request_timeout: self.request_timeout,
            ..LedgerSettings::default()
        }
    }
}

fn parse_http_addr(raw: &str) -> Result<SocketAddr, ConfigError> {
    let full = match raw.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => raw.to_string(),
    };
    full.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
        key: "HTTP_ADDR",
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Option<T>,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => default.ok_or_else(|| ConfigError::Invalid {
            key,
            value: String::new(),
            reason: "no default available".to_string(),
        }),
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
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_select_in_memory_backend() {
        let config = load(&[]).unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.database, None);
        assert_eq!(config.max_ledger_entries, 100);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.ledger_settings(), LedgerSettings::default());
    }

    #[test]
    fn database_settings_are_read_when_url_is_set() {
        let config = load(&[
            ("DATABASE_URL", "postgres://ledger@localhost/ledger"),
            ("DB_MAX_CONNECTIONS", "12"),
            ("DB_MAX_LIFETIME_SECS", "60"),
        ])
        .unwrap();
        let db = config.database.unwrap();
        assert_eq!(db.min_connections, 1);
        assert_eq!(db.max_connections, 12);
        assert_eq!(db.max_lifetime, Duration::from_secs(60));
        assert!(!format!("{db:?}").contains("postgres://"));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("DATABASE_URL", "  "), ("MAX_LEDGER_ENTRIES", "")]).unwrap();
        assert_eq!(config.database, None);
        assert_eq!(config.max_ledger_entries, 100);
    }

    #[test]
    fn invalid_values_name_the_key() {
        let err = load(&[("REQUEST_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "REQUEST_TIMEOUT_MS", .. }));

        let err = load(&[("MAX_LEDGER_ENTRIES", "1")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_LEDGER_ENTRIES", .. }));

        let err = load(&[("HTTP_ADDR", "localhost")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "HTTP_ADDR", .. }));

        let err = load(&[
            ("DATABASE_URL", "postgres://x"),
            ("DB_MIN_CONNECTIONS", "8"),
            ("DB_MAX_CONNECTIONS", "4"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "DB_MAX_CONNECTIONS", .. }));
    }

    #[test]
    fn http_addr_accepts_a_bare_port() {
        let config = load(&[("HTTP_ADDR", ":9090")]).unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:9090".parse::<SocketAddr>().unwrap());

        let config = load(&[("HTTP_ADDR", "127.0.0.1:3000")]).unwrap();
        assert_eq!(config.http_addr, "127.0.0.1:3000".parse::<SocketAddr>().unwrap());

        let err = load(&[("HTTP_ADDR", ":")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "HTTP_ADDR", .. }));
    }

    #[test]
    fn max_entries_flows_into_ledger_settings() {
        let config = load(&[("MAX_LEDGER_ENTRIES", "10"), ("REQUEST_TIMEOUT_MS", "250")]).unwrap();
        let settings = config.ledger_settings();
        assert_eq!(settings.limits.max_entries, 10);
        assert_eq!(settings.request_timeout, Duration::from_millis(250));
    }
}
