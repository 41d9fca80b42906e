//! Application state

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::AppConfig;
use crate::notifications::Notifier;
use crate::runs::RunRegistry;

/// Shared application state
pub struct AppState {
    /// Live configuration, replaced wholesale on reload
    config: ArcSwap<AppConfig>,

    /// Background task runs
    pub runs: RunRegistry,

    pub notifier: Notifier,
}

impl AppState {
    pub fn new(config: AppConfig, notifier: Notifier) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            runs: RunRegistry::new(),
            notifier,
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Arc<AppConfig> {
        self.config.load_full()
    }

    /// Install a new configuration and return the previous one.
    pub fn replace_config(&self, config: AppConfig) -> Arc<AppConfig> {
        self.config.swap(Arc::new(config))
    }
}
