//! # Configuration Management
//!
//! Loads the service configuration from several sources, lowest priority first:
//! 1. Built-in defaults (the `Default` impl below)
//! 2. An optional `config.toml` (or any other format the `config` crate recognizes)
//! 3. Environment variables prefixed with `APP_`, sections separated by `__`
//!    (e.g. `APP_SESSION__SILENCE_THRESHOLD_MS=1500`)
//! 4. `HOST` and `PORT`, which most deployment platforms set
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: The same structs are read from TOML, environment variables and JSON
//! - **#[serde(rename_all)]**: Enum variants appear as lowercase strings in every format
//! - **Duration helpers**: Raw millisecond fields stay serializable, callers get `Duration`

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub heartbeat: HeartbeatConfig,
    pub logging: LoggingConfig,
}

/// Where the service listens.
///
/// ## Fields:
/// - `host`: Bind address, `0.0.0.0` so the carrier can reach us
/// - `port`: TCP port (8007 is what carrier stream applets are usually pointed at)
/// - `ws_path`: Path the carrier upgrades to a WebSocket on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
}

/// How a call session takes turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EchoMode {
    /// Buffer the caller's turn, wait for silence, then play it back
    Conversational,
    /// Send every frame straight back as it arrives
    Immediate,
}

/// Turn-taking settings applied to every new session.
///
/// ## Fields:
/// - `silence_threshold_ms`: Quiet time after the last accepted frame that ends a turn
/// - `pacing_ms`: Gap between echoed frames during playback
/// - `echo_mode`: Conversational turn-taking or immediate echo
/// - `max_concurrent_sessions`: Calls served at once before new connections are refused
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub silence_threshold_ms: u64,
    pub pacing_ms: u64,
    pub echo_mode: EchoMode,
    pub max_concurrent_sessions: usize,
}

impl SessionConfig {
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 2000,  // 2 seconds of trailing silence ends a turn
            pacing_ms: 100,              // 100ms between echoed frames
            echo_mode: EchoMode::Conversational,
            max_concurrent_sessions: 100,
        }
    }
}

/// WebSocket keep-alive settings.
///
/// The server pings every `interval_secs` and drops a connection that has been silent
/// for longer than `interval_secs + timeout_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.interval_secs + self.timeout_secs)
    }
}

/// Where call records are persisted.
///
/// An empty `call_log_path` turns the JSON-lines call log off; records still go to tracing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub call_log_path: String,
}

impl LoggingConfig {
    pub fn call_log_path(&self) -> Option<&str> {
        let path = self.call_log_path.trim();
        (!path.is_empty()).then_some(path)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8007,
                ws_path: "/".to_string(),
            },
            session: SessionConfig::default(),
            heartbeat: HeartbeatConfig {
                interval_secs: 30,
                timeout_secs: 10,
            },
            logging: LoggingConfig {
                call_log_path: "logs/calls.log".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: Override server port
    /// - `APP_SESSION__ECHO_MODE=immediate`: Switch to immediate echo
    /// - `APP_LOGGING__CALL_LOG_PATH=`: Disable the call log
    /// - `HOST=0.0.0.0`, `PORT=3000`: Deployment platform shorthands
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values that would leave the service unable to serve a call.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(anyhow::anyhow!("WebSocket path must start with '/'"));
        }

        if self.session.silence_threshold_ms == 0 {
            return Err(anyhow::anyhow!("Silence threshold must be greater than 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.heartbeat.interval_secs == 0 || self.heartbeat.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval and timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON document on top of the current configuration.
    ///
    /// Only the keys present in `json_str` change, e.g. `{"session": {"pacing_ms": 50}}`
    /// leaves everything else alone. The merged result must still pass [`validate`].
    ///
    /// [`validate`]: AppConfig::validate
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, partial);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Recursively overlay `patch` onto `base`. Objects merge key by key, anything else replaces.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8007);
        assert_eq!(config.session.silence_threshold(), Duration::from_secs(2));
        assert_eq!(config.session.pacing(), Duration::from_millis(100));
        assert_eq!(config.session.echo_mode, EchoMode::Conversational);
        assert_eq!(config.heartbeat.client_timeout(), Duration::from_secs(40));
        assert_eq!(config.logging.call_log_path(), Some("logs/calls.log"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.silence_threshold_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.ws_path = "stream".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"session": {"pacing_ms": 40, "echo_mode": "immediate"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.session.pacing_ms, 40);
        assert_eq!(config.session.echo_mode, EchoMode::Immediate);
        // Untouched fields keep their values
        assert_eq!(config.session.silence_threshold_ms, 2000);
        assert_eq!(config.server.port, 8007);
    }

    #[test]
    fn test_invalid_update_leaves_config_unchanged() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 0}}"#).is_err());
        assert!(config.update_from_json(r#"{"session": {"echo_mode": "shout"}}"#).is_err());
        assert!(config.update_from_json("[]").is_err());
        assert_eq!(config.server.port, 8007);
        assert_eq!(config.session.echo_mode, EchoMode::Conversational);
    }

    #[test]
    fn test_blank_call_log_path_disables_log() {
        let mut config = AppConfig::default();
        config.logging.call_log_path = "  ".to_string();
        assert_eq!(config.logging.call_log_path(), None);
    }
}
