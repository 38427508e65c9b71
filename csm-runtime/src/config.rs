//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CSM_CONFIG or --config)
//! 3. Environment variables

use crate::service::{FnService, SelectionPolicy, ServiceImplementation, ServiceRegistry};
use csm_storage::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Instance execution settings.
    pub runtime: RuntimeConfig,
    /// Timer pool settings.
    pub timers: TimerConfig,
    /// Durable persistent variables.
    pub storage: StorageConfig,
    /// Local services to register.
    pub services: Vec<ServiceConfig>,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Self::default();

        // Load from file if specified
        if let Ok(path) = std::env::var("CSM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        // Apply environment variable overrides
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.runtime.apply_env_overrides();
        self.timers.apply_env_overrides();
        self.storage.apply_env_overrides();
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.event_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.event_channel_capacity must be positive".to_string(),
            ));
        }
        if self.storage.enabled && self.storage.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage enabled but data_dir not set".to_string(),
            ));
        }
        for service in &self.services {
            service.validate()?;
        }
        Ok(())
    }

    /// Builds a registry holding the configured services.
    pub fn service_registry(&self) -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new());
        for service in &self.services {
            registry.register(service.build());
        }
        registry
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Instance execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum running time of an instance in milliseconds (0 = none).
    pub deadline_ms: u64,
    /// Capacity of the in-process event bus observer channel.
    pub event_channel_capacity: usize,
    /// Service selection policy.
    pub selection_policy: SelectionPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 0,
            event_channel_capacity: 1024,
            selection_policy: SelectionPolicy::Optimal,
        }
    }
}

impl RuntimeConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(deadline) = std::env::var("CSM_DEADLINE_MS") {
            if let Ok(ms) = deadline.parse() {
                self.deadline_ms = ms;
            }
        }

        if let Ok(capacity) = std::env::var("CSM_EVENT_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.event_channel_capacity = n;
            }
        }

        if let Ok(policy) = std::env::var("CSM_SELECTION_POLICY") {
            self.selection_policy = match policy.to_lowercase().as_str() {
                "random" => SelectionPolicy::Random,
                _ => SelectionPolicy::Optimal,
            };
        }
    }

    /// Returns the instance deadline, if any.
    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_ms > 0).then(|| Duration::from_millis(self.deadline_ms))
    }
}

/// Timer pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Dedicated timer threads (0 = share the main runtime).
    pub worker_threads: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self { worker_threads: 2 }
    }
}

impl TimerConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(threads) = std::env::var("CSM_TIMER_THREADS") {
            if let Ok(n) = threads.parse() {
                self.worker_threads = n;
            }
        }
    }
}

/// Durable storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Keep persistent variables on disk. When disabled they live in memory.
    pub enabled: bool,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Sync the store file on every write.
    pub fsync: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("./data"),
            fsync: true,
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CSM_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(enabled) = std::env::var("CSM_PERSISTENCE_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }

        if let Ok(fsync) = std::env::var("CSM_FSYNC") {
            self.fsync = fsync == "1" || fsync.to_lowercase() == "true";
        }
    }

    /// Returns the variable store configuration.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(&self.data_dir).with_fsync(self.fsync)
    }
}

/// Built-in service behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Returns the input unchanged.
    Echo,
    /// Adds one to every integer input.
    Increment,
}

/// A local service definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service type name used by invoke actions.
    pub name: String,
    #[serde(default = "default_weight")]
    pub cost: f64,
    #[serde(default = "default_weight")]
    pub performance: f64,
    #[serde(default = "default_local")]
    pub local: bool,
    pub kind: ServiceKind,
}

fn default_weight() -> f64 {
    1.0
}

fn default_local() -> bool {
    true
}

impl ServiceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service name must not be empty".to_string(),
            ));
        }
        if !(self.cost.is_finite() && self.cost >= 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "service '{}' has invalid cost {}",
                self.name, self.cost
            )));
        }
        if !(self.performance.is_finite() && self.performance > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "service '{}' has invalid performance {}",
                self.name, self.performance
            )));
        }
        Ok(())
    }

    /// Builds the service implementation.
    pub fn build(&self) -> Arc<dyn ServiceImplementation> {
        let service = match self.kind {
            ServiceKind::Echo => FnService::echo(&self.name),
            ServiceKind::Increment => FnService::increment(&self.name),
        };
        Arc::new(
            service
                .with_cost(self.cost)
                .with_performance(self.performance)
                .with_local(self.local),
        )
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
