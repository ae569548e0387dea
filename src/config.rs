//! Configuration for lockfleet.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// lockfleet configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Resource identifiers, in order. Each gets exactly one lock.
    pub resources: Vec<String>,
    /// Worker profiles driven by the scheduler.
    pub workers: Vec<WorkerProfile>,
    /// Lock and work-step timing.
    pub coordination: CoordinationSettings,
    /// Startup retry policy.
    pub startup: StartupSettings,
    /// Shutdown drain policy.
    pub shutdown: ShutdownSettings,
    /// Fixed seed for the random source (entropy when absent).
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resources: [
                "node3.network.internal.gateway",
                "node4.network.internal.gateway",
                "node5.network.internal.hub",
                "node11.network.internal.hub",
                "node32.network.internal.balancer",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            workers: vec![
                WorkerProfile {
                    name: "slow".to_string(),
                    resource_count: 2,
                    min_work_secs: 3,
                    max_work_secs: 12,
                    period_secs: 10,
                },
                WorkerProfile {
                    name: "fast".to_string(),
                    resource_count: 2,
                    min_work_secs: 2,
                    max_work_secs: 7,
                    period_secs: 5,
                },
            ],
            coordination: CoordinationSettings::default(),
            startup: StartupSettings::default(),
            shutdown: ShutdownSettings::default(),
            seed: None,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Primary location: ~/.config/lockfleet/lockfleet.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join("lockfleet").join("lockfleet.yml");
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        let fallback_config = PathBuf::from("lockfleet.yml");
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config = Self::from_yaml(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(content: &str) -> crate::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check profile values and their fit against the resource list.
    ///
    /// An empty resource list is accepted here; startup retries the
    /// resource source instead.
    pub fn validate(&self) -> crate::Result<()> {
        if self.workers.is_empty() {
            return Err(Error::Config("no worker profiles configured".to_string()));
        }

        let mut names = HashSet::new();
        for profile in &self.workers {
            if !names.insert(profile.name.as_str()) {
                return Err(Error::Config(format!("duplicate worker profile '{}'", profile.name)));
            }
            profile.validate()?;
            if !self.resources.is_empty() {
                profile.check_fits(self.resource_count())?;
            }
        }

        if self.coordination.lock_timeout_ms == 0 {
            return Err(Error::Config("lock_timeout_ms must be positive".to_string()));
        }
        if self.startup.max_attempts == 0 {
            return Err(Error::Config("startup.max_attempts must be positive".to_string()));
        }

        Ok(())
    }

    /// Number of distinct configured resources.
    pub fn resource_count(&self) -> usize {
        self.resources.iter().collect::<HashSet<_>>().len()
    }
}

/// Immutable description of one periodic worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerProfile {
    /// Profile name, used in logs and stats.
    pub name: String,
    /// How many resources each firing tries to lock.
    pub resource_count: usize,
    /// Minimum simulated work per resource, in one-second steps.
    pub min_work_secs: u32,
    /// Maximum simulated work per resource, in one-second steps.
    pub max_work_secs: u32,
    /// Firing period in seconds.
    pub period_secs: u64,
}

impl WorkerProfile {
    /// Firing period.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Check that every value is positive and the duration range is ordered.
    pub fn validate(&self) -> crate::Result<()> {
        if self.resource_count == 0 || self.min_work_secs == 0 || self.max_work_secs == 0 || self.period_secs == 0 {
            return Err(Error::Config(format!(
                "worker profile '{}': all values must be positive",
                self.name
            )));
        }
        if self.min_work_secs > self.max_work_secs {
            return Err(Error::Config(format!(
                "worker profile '{}': min_work_secs {} exceeds max_work_secs {}",
                self.name, self.min_work_secs, self.max_work_secs
            )));
        }
        Ok(())
    }

    /// Check that the profile does not ask for more resources than exist.
    pub fn check_fits(&self, available: usize) -> crate::Result<()> {
        if self.resource_count > available {
            return Err(Error::Config(format!(
                "worker profile '{}' wants {} resources but only {} exist",
                self.name, self.resource_count, available
            )));
        }
        Ok(())
    }
}

/// Lock and work-step timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinationSettings {
    /// How long a run waits for each lock before abandoning.
    pub lock_timeout_ms: u64,
    /// Length of one simulated work step.
    pub step_interval_ms: u64,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 100,
            step_interval_ms: 1000,
        }
    }
}

impl CoordinationSettings {
    /// Lock acquisition timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Length of one work step.
    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms)
    }
}

/// Startup retry policy for an empty resource list.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StartupSettings {
    /// Attempts to load a non-empty resource list before giving up.
    pub max_attempts: u32,
    /// Delay between attempts, in seconds.
    pub retry_delay_secs: u64,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_delay_secs: 6,
        }
    }
}

impl StartupSettings {
    /// Delay between startup attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Shutdown drain policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// How long in-flight firings may run after shutdown starts.
    pub grace_period_secs: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self { grace_period_secs: 15 }
    }
}

impl ShutdownSettings {
    /// Drain grace period.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}
