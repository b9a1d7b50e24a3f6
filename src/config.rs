use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

pub use serde_env::error::Error as ConfigError;

/// Deserialize a config struct from the process environment, with any
/// `.env` file applied first.
pub(crate) fn read_env<D: DeserializeOwned>() -> Result<D, ConfigError> {
    dotenvy::dotenv().ok();
    serde_env::from_env()
}

/// Service configuration.
///
/// Every field has a default, so a bare environment boots a development
/// instance with in-memory backends. SMTP transport settings live on
/// [`MailerConfig`](crate::mail::MailerConfig) and are read separately.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Hourly send budget applied when a campaign omits its own limit.
    #[serde(default = "default_max_emails_per_hour")]
    pub max_emails_per_hour: u32,

    /// Per-worker pacing floor applied after each successful send.
    #[serde(default = "default_delay_between_emails_ms")]
    pub delay_between_emails_ms: u64,

    /// Number of concurrent send workers.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Envelope-from identity; also the key the hourly budget is counted against.
    #[serde(default = "default_mailer_from")]
    pub mailer_from: String,

    /// Postgres DSN. Absent, campaigns live in process memory only.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Redis URL for the shared rate counters. Absent, counters live in process memory.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Config {
    /// Read the configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        read_env()
    }

    pub fn pacing_floor(&self) -> Duration {
        Duration::from_millis(self.delay_between_emails_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_emails_per_hour: default_max_emails_per_hour(),
            delay_between_emails_ms: default_delay_between_emails_ms(),
            worker_concurrency: default_worker_concurrency(),
            mailer_from: default_mailer_from(),
            database_url: None,
            redis_url: None,
            port: default_port(),
        }
    }
}

fn default_max_emails_per_hour() -> u32 {
    200
}

fn default_delay_between_emails_ms() -> u64 {
    2000
}

fn default_worker_concurrency() -> usize {
    5
}

fn default_mailer_from() -> String {
    "noreply@reachinbox.app".to_string()
}

fn default_port() -> u16 {
    8080
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_emails_per_hour, 200);
        assert_eq!(config.delay_between_emails_ms, 2000);
        assert_eq!(config.worker_concurrency, 5);
        assert_eq!(config.mailer_from, "noreply@reachinbox.app");
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn deserializes_from_empty_map() {
        let config: Config = serde_json::from_str("{}").expect("all fields defaulted");
        assert_eq!(config.worker_concurrency, 5);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn from_env_applies_overrides() {
        std::env::set_var("WORKER_CONCURRENCY", "9");
        let config = Config::from_env().expect("environment parses");
        assert_eq!(config.worker_concurrency, 9);
        assert_eq!(config.port, 8080);
        std::env::remove_var("WORKER_CONCURRENCY");
    }
}
