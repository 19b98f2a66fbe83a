//! # Application State Management
//!
//! State shared by every HTTP handler and every WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Every actix worker thread holds a clone of the same state
//! - **RwLock**: Many handlers can read the configuration at once, a config update
//!   takes the lock exclusively
//!
//! ### Why the registry is not behind a lock here
//! [`SessionRegistry`] is already `Clone` and synchronizes internally, so cloning it into
//! `AppState` shares the same map of live calls.

use crate::config::AppConfig;
use crate::session::SessionRegistry;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The application state handed to handlers through `web::Data`.
///
/// ## Fields:
/// - `config`: Runtime configuration, updated by `PUT /api/v1/config`
/// - `registry`: Every live call session
/// - `start_time`: When the server started, for uptime reporting
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub registry: SessionRegistry,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, registry: SessionRegistry) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            registry,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately, so a WebSocket upgrade never holds it
    /// while the session starts.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Sessions that are already running keep the settings they were created with.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::TracingReporter;

    fn state() -> AppState {
        AppState::new(
            AppConfig::default(),
            SessionRegistry::new(Arc::new(TracingReporter)),
        )
    }

    #[test]
    fn test_update_config_validates() {
        let state = state();

        let mut config = state.get_config();
        config.session.pacing_ms = 20;
        assert!(state.update_config(config).is_ok());
        assert_eq!(state.get_config().session.pacing_ms, 20);

        let mut config = state.get_config();
        config.session.max_concurrent_sessions = 0;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().session.max_concurrent_sessions, 100);
    }
}
