//! Configuration module for turnwatch.
//!
//! Static settings come from environment variables with sensible defaults.
//! Monitoring settings may additionally come from a JSON settings file that is
//! re-read on every configuration reload.

use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub const MIN_PING_INTERVAL_SECS: u64 = 10;
pub const MAX_PING_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_RELOAD_INTERVAL_SECS: u64 = 300;

/// Timing of the monitoring loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Time between cycle starts, always within 10..=300 seconds.
    pub ping_interval: Duration,
    /// How often device records are re-read.
    pub reload_interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::new(DEFAULT_PING_INTERVAL_SECS, DEFAULT_RELOAD_INTERVAL_SECS)
    }
}

impl MonitorSettings {
    pub fn new(ping_interval_secs: u64, reload_interval_secs: u64) -> Self {
        Self {
            ping_interval: Duration::from_secs(clamp_ping_interval(ping_interval_secs)),
            reload_interval: Duration::from_secs(reload_interval_secs.max(1)),
        }
    }
}

pub fn clamp_ping_interval(secs: u64) -> u64 {
    secs.clamp(MIN_PING_INTERVAL_SECS, MAX_PING_INTERVAL_SECS)
}

/// Supplies monitoring settings at reload time.
pub trait SettingsSource: Send + Sync {
    fn monitor_settings(&self) -> MonitorSettings;
}

impl SettingsSource for MonitorSettings {
    fn monitor_settings(&self) -> MonitorSettings {
        *self
    }
}

/// Contents of the optional JSON settings file.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsFileContents {
    #[serde(default)]
    pub time_connect: Option<Value>,
    #[serde(rename = "TOKEN", default)]
    pub token: Option<String>,
    #[serde(default)]
    pub chat_id: Option<Value>,
}

impl SettingsFileContents {
    pub fn read(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        serde_json::from_str(&raw).map_err(|e| format!("cannot parse {}: {}", path.display(), e))
    }

    /// `time_connect` may be a number or a numeric string.
    pub fn ping_interval_secs(&self) -> Option<u64> {
        match self.time_connect.as_ref()? {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn chat_ids(&self) -> Vec<i64> {
        self.chat_id.as_ref().map(parse_chat_ids).unwrap_or_default()
    }
}

/// Accepts `"1,2"`, `1` or `[1, "2"]`.
pub fn parse_chat_ids(value: &Value) -> Vec<i64> {
    match value {
        Value::Number(n) => n.as_i64().into_iter().collect(),
        Value::String(s) => parse_chat_id_list(s),
        Value::Array(items) => items.iter().flat_map(parse_chat_ids).collect(),
        _ => Vec::new(),
    }
}

fn parse_chat_id_list(s: &str) -> Vec<i64> {
    s.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

/// Settings read from the JSON file when present, falling back to the
/// environment-derived defaults. A file that cannot be read or parsed keeps
/// the last settings that loaded.
pub struct SettingsFile {
    path: Option<PathBuf>,
    defaults: MonitorSettings,
    last_loaded: Mutex<Option<MonitorSettings>>,
}

impl SettingsFile {
    pub fn new(path: Option<PathBuf>, defaults: MonitorSettings) -> Self {
        Self {
            path,
            defaults,
            last_loaded: Mutex::new(None),
        }
    }
}

impl SettingsSource for SettingsFile {
    fn monitor_settings(&self) -> MonitorSettings {
        let Some(path) = &self.path else {
            return self.defaults;
        };

        let mut last_loaded = self.last_loaded.lock().unwrap();
        match SettingsFileContents::read(path) {
            Ok(contents) => {
                let settings = match contents.ping_interval_secs() {
                    Some(secs) => MonitorSettings {
                        ping_interval: Duration::from_secs(clamp_ping_interval(secs)),
                        ..self.defaults
                    },
                    None => self.defaults,
                };
                *last_loaded = Some(settings);
                settings
            }
            Err(e) => {
                let kept = last_loaded.unwrap_or(self.defaults);
                tracing::error!(
                    "Failed to load monitoring settings, keeping ping interval {}s: {}",
                    kept.ping_interval.as_secs(),
                    e
                );
                kept
            }
        }
    }
}

/// Chat notifier credentials.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_ids: Vec<i64>,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8771)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "turnwatch.db")
    pub db_path: String,
    /// Optional JSON settings file
    pub config_path: Option<PathBuf>,
    pub monitor: MonitorSettings,
    pub telegram: Option<TelegramConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8771,
            db_path: "turnwatch.db".to_string(),
            config_path: None,
            monitor: MonitorSettings::default(),
            telegram: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TURNWATCH_HTTP_PORT`: HTTP port (default: 8771)
    /// - `TURNWATCH_DB_PATH`: Database file path (default: "turnwatch.db")
    /// - `TURNWATCH_PING_INTERVAL`: seconds between cycles, clamped to 10..=300 (default: 30)
    /// - `TURNWATCH_RELOAD_INTERVAL`: seconds between device reloads (default: 300)
    /// - `TURNWATCH_CONFIG`: JSON file with `time_connect`, `TOKEN` and `chat_id`
    /// - `TURNWATCH_TELEGRAM_TOKEN`, `TURNWATCH_TELEGRAM_CHAT_IDS`: override the file
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = env_parse("TURNWATCH_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Ok(db_path) = env::var("TURNWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        let ping_interval = env_parse("TURNWATCH_PING_INTERVAL").unwrap_or(DEFAULT_PING_INTERVAL_SECS);
        let reload_interval =
            env_parse("TURNWATCH_RELOAD_INTERVAL").unwrap_or(DEFAULT_RELOAD_INTERVAL_SECS);
        cfg.monitor = MonitorSettings::new(ping_interval, reload_interval);

        cfg.config_path = env::var_os("TURNWATCH_CONFIG").map(PathBuf::from);

        let file = match &cfg.config_path {
            Some(path) => SettingsFileContents::read(path).unwrap_or_else(|e| {
                tracing::error!("Ignoring settings file: {}", e);
                SettingsFileContents::default()
            }),
            None => SettingsFileContents::default(),
        };

        let token = env::var("TURNWATCH_TELEGRAM_TOKEN").ok().or(file.token.clone());
        let chat_ids = match env::var("TURNWATCH_TELEGRAM_CHAT_IDS") {
            Ok(ids) => parse_chat_id_list(&ids),
            Err(_) => file.chat_ids(),
        };
        cfg.telegram = token
            .filter(|t| !t.trim().is_empty())
            .map(|token| TelegramConfig { token, chat_ids });

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8771);
        assert_eq!(cfg.db_path, "turnwatch.db");
        assert_eq!(cfg.monitor.ping_interval, Duration::from_secs(30));
        assert_eq!(cfg.monitor.reload_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_ping_interval_is_clamped() {
        assert_eq!(MonitorSettings::new(1, 300).ping_interval, Duration::from_secs(10));
        assert_eq!(MonitorSettings::new(9000, 300).ping_interval, Duration::from_secs(300));
        assert_eq!(MonitorSettings::new(45, 300).ping_interval, Duration::from_secs(45));
    }

    #[test]
    fn test_chat_id_formats() {
        assert_eq!(parse_chat_ids(&serde_json::json!("11, 22,bad")), vec![11, 22]);
        assert_eq!(parse_chat_ids(&serde_json::json!(33)), vec![33]);
        assert_eq!(parse_chat_ids(&serde_json::json!([44, "55"])), vec![44, 55]);
    }

    #[test]
    fn test_settings_file_reread() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"time_connect": "5", "TOKEN": "abc", "chat_id": "1,2"}}"#).unwrap();

        let source = SettingsFile::new(Some(file.path().to_path_buf()), MonitorSettings::default());
        let settings = source.monitor_settings();
        assert_eq!(settings.ping_interval, Duration::from_secs(10));
        assert_eq!(settings.reload_interval, Duration::from_secs(300));

        std::fs::write(file.path(), r#"{"time_connect": 120}"#).unwrap();
        assert_eq!(
            source.monitor_settings().ping_interval,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_broken_settings_file_falls_back() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let defaults = MonitorSettings::new(60, 300);
        let source = SettingsFile::new(Some(file.path().to_path_buf()), defaults);
        assert_eq!(source.monitor_settings(), defaults);
    }

    #[test]
    fn test_unreadable_settings_file_keeps_last_interval() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), r#"{"time_connect": 120}"#).unwrap();

        let source = SettingsFile::new(Some(file.path().to_path_buf()), MonitorSettings::default());
        assert_eq!(source.monitor_settings().ping_interval, Duration::from_secs(120));

        // Half-written file
        std::fs::write(file.path(), r#"{"time_con"#).unwrap();
        assert_eq!(source.monitor_settings().ping_interval, Duration::from_secs(120));

        std::fs::write(file.path(), r#"{"time_connect": 45}"#).unwrap();
        assert_eq!(source.monitor_settings().ping_interval, Duration::from_secs(45));
    }
}
