//! Target registry: an immutable, atomically swappable snapshot of the
//! monitor configuration.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::{ConfigError, MonitorConfig, Settings};
use crate::db::Target;

/// Point-in-time view of the targets and settings.
#[derive(Debug)]
pub struct RegistrySnapshot {
    /// Incremented on every accepted replacement.
    pub generation: u64,
    pub config: MonitorConfig,
}

impl RegistrySnapshot {
    pub fn targets(&self) -> &[Target] {
        &self.config.targets
    }

    pub fn settings(&self) -> &Settings {
        &self.config.settings
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.config.targets.iter().find(|t| t.name == name)
    }
}

/// Holds the current snapshot. Readers clone an `Arc`; replacement is a
/// single swap, so a cycle keeps the snapshot it started with.
pub struct TargetRegistry {
    current: watch::Sender<Arc<RegistrySnapshot>>,
}

impl TargetRegistry {
    pub fn new(config: MonitorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (current, _) = watch::channel(Arc::new(RegistrySnapshot { generation: 1, config }));
        Ok(Self { current })
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.borrow().clone()
    }

    /// Receiver notified on every accepted replacement.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.current.subscribe()
    }

    /// Replace the whole configuration. An invalid config is rejected and the
    /// previous snapshot stays in effect.
    pub fn replace(&self, config: MonitorConfig) -> Result<u64, ConfigError> {
        config.validate()?;
        let mut generation = 0;
        self.current.send_modify(|current| {
            generation = current.generation + 1;
            *current = Arc::new(RegistrySnapshot { generation, config });
        });
        Ok(generation)
    }

    /// Re-read the config file and swap it in.
    pub fn reload_from(&self, path: impl AsRef<Path>) -> Result<u64, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = MonitorConfig::from_toml(&text)?;
        self.replace(config)
    }
}
