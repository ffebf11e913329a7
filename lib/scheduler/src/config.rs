//! Engine configuration.
//!
//! Loaded via the `config` crate from `AUTOFLOW__*` environment variables,
//! e.g. `AUTOFLOW__RUN_TIMEOUT_SECS=600` or
//! `AUTOFLOW__PLAN_RUN_TIMEOUTS__ENTERPRISE=3600`.

use async_trait::async_trait;
use autoflow_core::OrganizationId;
use autoflow_workflow::GraphLimits;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Subscription tier of an organization, used to pick the run deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Starter,
    Business,
    Enterprise,
}

/// Resolves the plan tier of an organization.
#[async_trait]
pub trait PlanLookup: Send + Sync {
    /// Returns the organization's tier, or `None` to use the default deadline.
    async fn plan_tier(&self, organization_id: OrganizationId) -> Option<PlanTier>;
}

/// Plan lookup that knows no plans; every run gets the default deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPlan;

#[async_trait]
impl PlanLookup for DefaultPlan {
    async fn plan_tier(&self, _: OrganizationId) -> Option<PlanTier> {
        None
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    /// Maximum nodes per definition.
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,

    /// Run deadline for organizations without a plan override, in seconds.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Per-plan run deadlines, in seconds.
    #[serde(default)]
    pub plan_run_timeouts: HashMap<PlanTier, u64>,

    /// Bound on a single adapter call, in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Maximum executions driven concurrently.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Interval between scans for due waiting runs, in milliseconds.
    #[serde(default = "default_resume_poll_interval_ms")]
    pub resume_poll_interval_ms: u64,

    /// How long a driver may hold an execution without renewing, in seconds.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

/// Longest run deadline accepted, in seconds (one year).
pub const MAX_RUN_TIMEOUT_SECS: u64 = 366 * 24 * 60 * 60;

fn default_max_nodes() -> usize {
    100
}

fn default_run_timeout_secs() -> u64 {
    300
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_worker_pool_size() -> usize {
    16
}

fn default_resume_poll_interval_ms() -> u64 {
    1000
}

fn default_lease_ttl_secs() -> u64 {
    600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_nodes: default_max_nodes(),
            run_timeout_secs: default_run_timeout_secs(),
            plan_run_timeouts: HashMap::new(),
            call_timeout_secs: default_call_timeout_secs(),
            worker_pool_size: default_worker_pool_size(),
            resume_poll_interval_ms: default_resume_poll_interval_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("AUTOFLOW")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

impl EngineConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but cannot be parsed, or
    /// if the resulting configuration fails [`EngineConfig::validate`].
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(environment())
    }

    fn load(source: config::Environment) -> Result<Self, config::ConfigError> {
        let config: Self = config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that limits and intervals are usable.
    ///
    /// Counts, timeouts and intervals must be non-zero and run deadlines
    /// may not exceed [`MAX_RUN_TIMEOUT_SECS`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Message` naming the first offending setting.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let non_zero = [
            ("max_nodes", self.max_nodes as u64),
            ("run_timeout_secs", self.run_timeout_secs),
            ("call_timeout_secs", self.call_timeout_secs),
            ("worker_pool_size", self.worker_pool_size as u64),
            ("resume_poll_interval_ms", self.resume_poll_interval_ms),
            ("lease_ttl_secs", self.lease_ttl_secs),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(config::ConfigError::Message(format!("{name} must be greater than zero")));
        }

        let mut deadlines: Vec<(String, u64)> =
            vec![("run_timeout_secs".to_string(), self.run_timeout_secs)];
        deadlines.extend(
            self.plan_run_timeouts
                .iter()
                .map(|(tier, secs)| (format!("plan_run_timeouts.{tier:?}"), *secs)),
        );
        for (name, secs) in deadlines {
            if secs == 0 || secs > MAX_RUN_TIMEOUT_SECS {
                return Err(config::ConfigError::Message(format!(
                    "{name} must be between 1 and {MAX_RUN_TIMEOUT_SECS} seconds, got {secs}"
                )));
            }
        }
        Ok(())
    }

    /// Limits applied when validating definitions.
    #[must_use]
    pub fn graph_limits(&self) -> GraphLimits {
        GraphLimits {
            max_nodes: self.max_nodes,
        }
    }

    /// Run deadline for an organization on the given plan.
    #[must_use]
    pub fn run_timeout(&self, plan: Option<PlanTier>) -> Duration {
        let secs = plan
            .and_then(|tier| self.plan_run_timeouts.get(&tier).copied())
            .unwrap_or(self.run_timeout_secs);
        Duration::from_secs(secs.min(MAX_RUN_TIMEOUT_SECS))
    }

    /// Default bound on a single adapter call.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Interval between resume scans.
    #[must_use]
    pub fn resume_poll_interval(&self) -> Duration {
        Duration::from_millis(self.resume_poll_interval_ms.max(1))
    }

    /// Lease lifetime.
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn try_load(vars: &[(&str, &str)]) -> Result<EngineConfig, config::ConfigError> {
        let vars = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<HashMap<_, _>>();
        EngineConfig::load(environment().source(Some(vars)))
    }

    fn load(vars: &[(&str, &str)]) -> EngineConfig {
        try_load(vars).expect("config")
    }

    #[test]
    fn defaults_apply_without_variables() {
        let config = load(&[]);
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_nodes, 100);
        assert_eq!(config.run_timeout(None), Duration::from_secs(300));
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.worker_pool_size, 16);
        assert_eq!(config.lease_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn variables_override_defaults() {
        let config = load(&[
            ("AUTOFLOW__MAX_NODES", "25"),
            ("AUTOFLOW__CALL_TIMEOUT_SECS", "10"),
            ("AUTOFLOW__PLAN_RUN_TIMEOUTS__ENTERPRISE", "3600"),
        ]);
        assert_eq!(config.graph_limits().max_nodes, 25);
        assert_eq!(config.call_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.run_timeout(Some(PlanTier::Enterprise)),
            Duration::from_secs(3600)
        );
        assert_eq!(
            config.run_timeout(Some(PlanTier::Free)),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = try_load(&[("AUTOFLOW__RESUME_POLL_INTERVAL_MS", "0")]).expect_err("invalid");
        assert!(err.to_string().contains("resume_poll_interval_ms"));
    }

    #[test]
    fn oversized_run_timeouts_are_rejected() {
        let err = try_load(&[("AUTOFLOW__RUN_TIMEOUT_SECS", "1000000000000000")])
            .expect_err("invalid");
        assert!(err.to_string().contains("run_timeout_secs"));

        let err = try_load(&[("AUTOFLOW__PLAN_RUN_TIMEOUTS__BUSINESS", "1000000000000000")])
            .expect_err("invalid");
        assert!(err.to_string().contains("plan_run_timeouts"));
    }

    #[test]
    fn hand_built_config_is_clamped() {
        let config = EngineConfig {
            run_timeout_secs: u64::MAX,
            resume_poll_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(
            config.run_timeout(None),
            Duration::from_secs(MAX_RUN_TIMEOUT_SECS)
        );
        assert_eq!(config.resume_poll_interval(), Duration::from_millis(1));
    }
}
