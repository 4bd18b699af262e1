use crate::error::RealtimeError;
use crate::reconnect::ReconnectPolicy;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How often the supervisor checks for dropped channels
    pub check_interval_secs: u64,
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            ..Default::default()
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub reconnect: ReconnectConfig,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, RealtimeError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| RealtimeError::Config(format!("{name} is not a valid number: {raw}"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, RealtimeError> {
        dotenv().ok();

        let url = env::var("DATABASE_URL")
            .map_err(|_| RealtimeError::Config("DATABASE_URL missing".into()))?;

        let reconnect = ReconnectConfig {
            max_retries: parse_var("RECONNECT_MAX_RETRIES", 5)?,
            initial_backoff_ms: parse_var("RECONNECT_INITIAL_BACKOFF_MS", 200)?,
            max_backoff_ms: parse_var("RECONNECT_MAX_BACKOFF_MS", 10_000)?,
            check_interval_secs: parse_var("RECONNECT_CHECK_INTERVAL_SECS", 15)?,
        };

        if reconnect.check_interval_secs == 0 {
            return Err(RealtimeError::Config(
                "RECONNECT_CHECK_INTERVAL_SECS must be greater than zero".into(),
            ));
        }

        Ok(Config {
            database: DatabaseConfig {
                url,
                max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,
            },
            reconnect,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "DATABASE_MAX_CONNECTIONS",
        "RECONNECT_MAX_RETRIES",
        "RECONNECT_INITIAL_BACKOFF_MS",
        "RECONNECT_MAX_BACKOFF_MS",
        "RECONNECT_CHECK_INTERVAL_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        env::set_var("DATABASE_URL", "postgres://localhost/storefront");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database.url, "postgres://localhost/storefront");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.reconnect.max_retries, 5);
        assert_eq!(config.reconnect.policy().initial_backoff, Duration::from_millis(200));
        assert_eq!(config.reconnect.check_interval(), Duration::from_secs(15));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_number_is_config_error() {
        clear_env();
        env::set_var("DATABASE_URL", "postgres://localhost/storefront");
        env::set_var("RECONNECT_MAX_RETRIES", "many");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RealtimeError::Config(msg) if msg.contains("RECONNECT_MAX_RETRIES")));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_zero_check_interval_rejected() {
        clear_env();
        env::set_var("DATABASE_URL", "postgres://localhost/storefront");
        env::set_var("RECONNECT_CHECK_INTERVAL_SECS", "0");

        assert!(Config::from_env().is_err());

        clear_env();
    }
}
