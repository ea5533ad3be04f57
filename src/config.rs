use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::context::UserPreferences;
use crate::orchestration::breaker::BreakerConfig;
use crate::orchestration::failsafe::{FailsafeConfig, ResourceThresholds};
use crate::orchestration::router::RoutingTable;
use crate::orchestration::scorer::{ScorerConfig, ScoringWeights};
use crate::orchestration::supervisor::SupervisorConfig;
use crate::{Error, Result};

/// Every threshold the orchestrator reads. Durations are stored as
/// integer milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_workers: usize,
    /// Default retries per task; `Task::max_retries` overrides it. Must
    /// stay below `human_failure_threshold`, which routes a task to a
    /// human once its failures reach it.
    pub max_retries: u32,

    pub breaker_failure_threshold: u32,
    #[serde(with = "duration_ms")]
    pub breaker_timeout: Duration,
    pub breaker_backoff_factor: f64,
    #[serde(with = "duration_ms")]
    pub breaker_max_timeout: Duration,

    pub error_rate_threshold: f64,
    #[serde(with = "duration_ms")]
    pub error_window: Duration,
    pub error_min_samples: usize,
    pub consecutive_error_threshold: u32,
    #[serde(with = "duration_ms")]
    pub stuck_task_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub task_wall_clock_limit: Duration,
    pub max_iterations: u32,
    pub min_confidence: f64,
    #[serde(with = "duration_ms")]
    pub sample_interval: Duration,
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,

    pub auto_resume_enabled: bool,
    #[serde(with = "duration_ms")]
    pub escalation_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub task_timeout: Duration,
    /// Pause after which error-history conditions no longer hold a worker.
    #[serde(with = "duration_ms")]
    pub pause_cooldown: Duration,

    /// Pause between passes when every ready task was deferred.
    #[serde(with = "duration_ms")]
    pub stall_backoff: Duration,
    /// Consecutive deferred passes tolerated before the workflow is stuck.
    pub max_stalled_passes: u32,

    pub history_capacity: usize,
    pub domain_window: usize,
    /// Failed attempts after which a task is routed to a human.
    pub human_failure_threshold: u32,

    pub resource_thresholds: ResourceThresholds,
    pub weights: ScoringWeights,
    pub scoring: ScorerConfig,
    pub routing: RoutingTable,
    pub preferences: UserPreferences,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 4,
            max_retries: 2,
            breaker_failure_threshold: 5,
            breaker_timeout: Duration::from_secs(30),
            breaker_backoff_factor: 2.0,
            breaker_max_timeout: Duration::from_secs(300),
            error_rate_threshold: 0.5,
            error_window: Duration::from_secs(300),
            error_min_samples: 5,
            consecutive_error_threshold: 5,
            stuck_task_timeout: Duration::from_secs(600),
            task_wall_clock_limit: Duration::from_secs(3600),
            max_iterations: 20,
            min_confidence: 0.3,
            sample_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(1),
            auto_resume_enabled: true,
            escalation_timeout: Duration::from_secs(1800),
            task_timeout: Duration::from_secs(900),
            pause_cooldown: Duration::from_secs(30),
            stall_backoff: Duration::from_secs(1),
            max_stalled_passes: 3,
            history_capacity: 100,
            domain_window: 10,
            human_failure_threshold: 3,
            resource_thresholds: ResourceThresholds::default(),
            weights: ScoringWeights::default(),
            scoring: ScorerConfig::default(),
            routing: RoutingTable::default(),
            preferences: UserPreferences::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "loading orchestrator config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml_string()?)?;
        tracing::debug!(path = %path.display(), "orchestrator config saved");
        Ok(())
    }

    /// Reject values no workflow can run with.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> Result<()> {
            Err(Error::InvalidConfig(msg.to_string()))
        }

        if self.max_concurrent_workers == 0 {
            return invalid("max_concurrent_workers must be at least 1");
        }
        if self.max_retries >= self.human_failure_threshold {
            return Err(Error::InvalidConfig(format!(
                "max_retries {} must be below human_failure_threshold {}",
                self.max_retries, self.human_failure_threshold
            )));
        }
        if self.breaker_failure_threshold == 0 {
            return invalid("breaker_failure_threshold must be at least 1");
        }
        if !self.breaker_backoff_factor.is_finite() || self.breaker_backoff_factor < 1.0 {
            return invalid("breaker_backoff_factor must be a finite number >= 1.0");
        }
        if self.breaker_max_timeout < self.breaker_timeout {
            return invalid("breaker_max_timeout must not be shorter than breaker_timeout");
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return invalid("error_rate_threshold must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return invalid("min_confidence must be within [0, 1]");
        }
        for (name, t) in [
            ("cpu", self.resource_thresholds.cpu),
            ("memory", self.resource_thresholds.memory),
            ("disk", self.resource_thresholds.disk),
        ] {
            if t.warning > t.critical {
                return Err(Error::InvalidConfig(format!(
                    "{} warning threshold {} exceeds critical {}",
                    name, t.warning, t.critical
                )));
            }
        }
        if self.task_timeout.is_zero() || self.sample_interval.is_zero() || self.probe_timeout.is_zero() {
            return invalid("task_timeout, sample_interval and probe_timeout must be non-zero");
        }
        if self.domain_window == 0 {
            return invalid("domain_window must be at least 1");
        }
        self.weights.validate()
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            timeout: self.breaker_timeout,
            backoff_factor: self.breaker_backoff_factor,
            max_timeout: self.breaker_max_timeout,
        }
    }

    pub fn failsafe_config(&self) -> FailsafeConfig {
        FailsafeConfig {
            thresholds: self.resource_thresholds,
            error_rate_threshold: self.error_rate_threshold,
            error_window: self.error_window,
            error_min_samples: self.error_min_samples,
            consecutive_error_threshold: self.consecutive_error_threshold,
            max_iterations: self.max_iterations,
            task_wall_clock_limit: self.task_wall_clock_limit,
            stuck_task_timeout: self.stuck_task_timeout,
            min_confidence: self.min_confidence,
            probe_timeout: self.probe_timeout,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            task_timeout: self.task_timeout,
            auto_resume_enabled: self.auto_resume_enabled,
            escalation_timeout: self.escalation_timeout,
            pause_cooldown: self.pause_cooldown,
        }
    }
}

/// Serialize a `Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
