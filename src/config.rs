//! Configuration for the guardian.
//!
//! Process settings come from environment variables with sensible defaults.
//! The monitored targets and check settings come from a TOML file that can
//! be reloaded while running.

use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::Target;

/// Placeholder left in generated config files; treated as "no webhook".
pub const WEBHOOK_PLACEHOLDER: &str = "YOUR_DISCORD_WEBHOOK_URL";

const DEFAULT_CONFIG: &str = r#"# Outproxy guardian configuration.

[settings]
check_interval_seconds = 300
# A failed target is only confirmed offline if it still fails this long after the first failure.
retest_delay_seconds = 30
probe_timeout_seconds = 30
verification_url = "https://api.ipify.org?format=json"
alert_webhook_url = "YOUR_DISCORD_WEBHOOK_URL"
alert_max_attempts = 3
alert_backoff_seconds = 2
history_retention_days = 0

[[targets]]
name = "example-proxy"
url = "http://127.0.0.1:8080"
category = "frontend"

[[targets]]
name = "i2p-user-test"
url = "http://127.0.0.1:4444"
category = "user-test"
"#;

/// Upper bounds on duration settings. Anything larger is a typo, and would
/// overflow the time arithmetic downstream.
const MAX_CHECK_INTERVAL_SECONDS: u64 = 7 * 24 * 60 * 60;
const MAX_RETEST_DELAY_SECONDS: u64 = 24 * 60 * 60;
const MAX_ALERT_BACKOFF_SECONDS: u64 = 60 * 60;
const MAX_HISTORY_RETENTION_DAYS: u64 = 100 * 365;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the status API (default: 5000)
    pub http_port: u16,
    /// Path to the SQLite ledger (default: "proxy_status.db")
    pub db_path: String,
    /// Path to the monitor config file (default: "guardian.toml")
    pub config_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 5000,
            db_path: "proxy_status.db".to_string(),
            config_path: "guardian.toml".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `GUARDIAN_HTTP_PORT`: HTTP port (default: 5000)
    /// - `GUARDIAN_DB_PATH`: Database file path (default: "proxy_status.db")
    /// - `GUARDIAN_CONFIG`: Monitor config path (default: "guardian.toml")
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("GUARDIAN_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("GUARDIAN_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(config_path) = env::var("GUARDIAN_CONFIG") {
            cfg.config_path = config_path;
        }

        cfg
    }
}

/// Check and alerting settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub check_interval_seconds: u64,
    pub retest_delay_seconds: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    /// Defaults to four fifths of the check interval.
    #[serde(default)]
    pub cycle_timeout_seconds: Option<u64>,
    pub verification_url: String,
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
    #[serde(default = "default_alert_attempts")]
    pub alert_max_attempts: u32,
    #[serde(default = "default_alert_backoff")]
    pub alert_backoff_seconds: u64,
    /// Zero keeps history forever.
    #[serde(default)]
    pub history_retention_days: u64,
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_alert_attempts() -> u32 {
    3
}

fn default_alert_backoff() -> u64 {
    2
}

impl Settings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn retest_delay(&self) -> Duration {
        Duration::from_secs(self.retest_delay_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn cycle_timeout(&self) -> Duration {
        match self.cycle_timeout_seconds {
            Some(secs) => Duration::from_secs(secs),
            None => self.check_interval() * 4 / 5,
        }
    }

    pub fn alert_backoff(&self) -> Duration {
        Duration::from_secs(self.alert_backoff_seconds)
    }

    /// Webhook URL, if one is actually configured.
    pub fn webhook_url(&self) -> Option<&str> {
        self.alert_webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty() && *url != WEBHOOK_PLACEHOLDER)
    }
}

/// Monitor configuration: settings plus the ordered target list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub settings: Settings,
    #[serde(default)]
    pub targets: Vec<Target>,
}

impl MonitorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file, writing a default one first if it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("{} not found, writing a default config", path.display());
            std::fs::write(path, DEFAULT_CONFIG)?;
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Basic presence and sanity checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.settings;
        if s.check_interval_seconds == 0 {
            return Err(invalid("check_interval_seconds must be greater than zero"));
        }
        if s.check_interval_seconds > MAX_CHECK_INTERVAL_SECONDS {
            return Err(invalid(format!(
                "check_interval_seconds must be at most {}",
                MAX_CHECK_INTERVAL_SECONDS
            )));
        }
        if s.probe_timeout_seconds == 0 || s.probe_timeout_seconds > MAX_CHECK_INTERVAL_SECONDS {
            return Err(invalid(format!(
                "probe_timeout_seconds must be between 1 and {}",
                MAX_CHECK_INTERVAL_SECONDS
            )));
        }
        if s.retest_delay_seconds > MAX_RETEST_DELAY_SECONDS {
            return Err(invalid(format!(
                "retest_delay_seconds must be at most {}",
                MAX_RETEST_DELAY_SECONDS
            )));
        }
        if s.alert_backoff_seconds > MAX_ALERT_BACKOFF_SECONDS {
            return Err(invalid(format!(
                "alert_backoff_seconds must be at most {}",
                MAX_ALERT_BACKOFF_SECONDS
            )));
        }
        if s.history_retention_days > MAX_HISTORY_RETENTION_DAYS {
            return Err(invalid(format!(
                "history_retention_days must be at most {}",
                MAX_HISTORY_RETENTION_DAYS
            )));
        }
        if s.cycle_timeout().is_zero() || s.cycle_timeout() >= s.check_interval() {
            return Err(invalid("cycle timeout must be positive and shorter than the check interval"));
        }
        if s.alert_max_attempts == 0 {
            return Err(invalid("alert_max_attempts must be at least 1"));
        }
        validate_url("verification_url", &s.verification_url)?;
        if let Some(url) = s.webhook_url() {
            validate_url("alert_webhook_url", url)?;
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if !name_pattern().is_match(&target.name) {
                return Err(invalid(format!("invalid target name {:?}", target.name)));
            }
            if !seen.insert(target.name.as_str()) {
                return Err(invalid(format!("duplicate target name {:?}", target.name)));
            }
            validate_url(&format!("url of target {}", target.name), &target.url)?;
        }

        Ok(())
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("static regex"))
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = reqwest::Url::parse(value).map_err(|e| invalid(format!("{}: {}", field, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("{}: unsupported scheme {}", field, other))),
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Category;

    const VALID: &str = r#"
        [settings]
        check_interval_seconds = 60
        retest_delay_seconds = 30
        verification_url = "https://api.ipify.org?format=json"

        [[targets]]
        name = "fe-1"
        url = "http://10.0.0.1:8080"
        category = "frontend"

        [[targets]]
        name = "be-1"
        url = "http://10.0.0.2:3128"
        category = "backend"
    "#;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 5000);
        assert_eq!(cfg.db_path, "proxy_status.db");
        assert_eq!(cfg.config_path, "guardian.toml");
    }

    #[test]
    fn test_parse_valid_config() {
        let cfg = MonitorConfig::from_toml(VALID).unwrap();
        assert_eq!(cfg.targets.len(), 2);
        assert_eq!(cfg.targets[1].category, Category::Backend);
        assert_eq!(cfg.settings.probe_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.settings.cycle_timeout(), Duration::from_secs(48));
        assert_eq!(cfg.settings.alert_max_attempts, 3);
        assert_eq!(cfg.settings.webhook_url(), None);
    }

    #[test]
    fn test_bundled_default_config_is_valid() {
        let cfg = MonitorConfig::from_toml(DEFAULT_CONFIG).unwrap();
        assert_eq!(cfg.targets.len(), 2);
        assert_eq!(cfg.targets[1].category, Category::UserTest);
        // The placeholder webhook disables delivery.
        assert_eq!(cfg.settings.webhook_url(), None);
    }

    #[test]
    fn test_missing_required_setting_is_rejected() {
        let text = VALID.replace("retest_delay_seconds = 30", "");
        assert!(matches!(MonitorConfig::from_toml(&text), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let text = VALID.replace("be-1", "fe-1");
        assert!(matches!(MonitorConfig::from_toml(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_urls_and_intervals_are_rejected() {
        let bad_url = VALID.replace("http://10.0.0.2:3128", "not a url");
        assert!(MonitorConfig::from_toml(&bad_url).is_err());

        let zero = VALID.replace("check_interval_seconds = 60", "check_interval_seconds = 0");
        assert!(MonitorConfig::from_toml(&zero).is_err());

        let long_cycle = VALID.replace(
            "retest_delay_seconds = 30",
            "retest_delay_seconds = 30\ncycle_timeout_seconds = 60",
        );
        assert!(MonitorConfig::from_toml(&long_cycle).is_err());
    }

    #[test]
    fn test_oversized_durations_are_rejected() {
        let retention = VALID.replace(
            "retest_delay_seconds = 30",
            "retest_delay_seconds = 30\nhistory_retention_days = 1000000000000",
        );
        assert!(matches!(MonitorConfig::from_toml(&retention), Err(ConfigError::Invalid(_))));

        let interval = VALID.replace(
            "check_interval_seconds = 60",
            "check_interval_seconds = 9223372036854775807",
        );
        assert!(matches!(MonitorConfig::from_toml(&interval), Err(ConfigError::Invalid(_))));

        let retest = VALID.replace("retest_delay_seconds = 30", "retest_delay_seconds = 86401");
        assert!(matches!(MonitorConfig::from_toml(&retest), Err(ConfigError::Invalid(_))));

        let century = VALID.replace(
            "retest_delay_seconds = 30",
            "retest_delay_seconds = 30\nhistory_retention_days = 36500",
        );
        assert!(MonitorConfig::from_toml(&century).is_ok());
    }

    #[test]
    fn test_load_writes_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guardian.toml");

        let cfg = MonitorConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.settings.check_interval_seconds, 300);
    }
}
