//! Master configuration
//!
//! Loaded from a JSON file, then overridden from `BSP_*` environment
//! variables, then validated.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::checkpoint::CheckpointConfig;
use crate::coordinator::assignment::InputConfig;
use crate::coordinator::balancer::BalancerKind;
use crate::coordinator::membership::HealthConfig;
use crate::error::{BspError, Result};
use crate::graph;
use crate::storage::StorageConfig;

/// Complete master configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Job identifier; namespaces every coordination path
    pub job_id: String,
    /// Hostname this master advertises in its election bid
    pub hostname: String,
    /// Task partition of this master
    pub partition_id: u32,
    pub health: HealthConfig,
    pub checkpoint: CheckpointConfig,
    pub storage: StorageConfig,
    pub balancer: BalancerKind,
    pub input: InputConfig,
    /// Start from this checkpointed superstep instead of loading input
    pub restart_superstep: Option<u64>,
    /// Restarts from checkpoint allowed before the job fails
    pub max_restart_attempts: u32,
    /// Keep all coordination state after supersteps and at job end
    pub keep_coordination_data: bool,
    /// Cleaned-up markers to wait for before removing job state
    pub expected_cleanup_tasks: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            job_id: "bsp-job".into(),
            hostname: "localhost".into(),
            partition_id: 0,
            health: HealthConfig::default(),
            checkpoint: CheckpointConfig::default(),
            storage: StorageConfig::default(),
            balancer: BalancerKind::default(),
            input: InputConfig::default(),
            restart_superstep: None,
            max_restart_attempts: 3,
            keep_coordination_data: false,
            expected_cleanup_tasks: 1,
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| BspError::InvalidConfig {
        reason: format!("{}={} is not valid", key, raw),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(BspError::InvalidConfig {
            reason: format!("{}={} is not a boolean", key, raw),
        }),
    }
}

impl MasterConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| BspError::InvalidConfig {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&raw).map_err(|e| BspError::InvalidConfig {
            reason: format!("cannot parse {}: {}", path.display(), e),
        })
    }

    /// Apply `BSP_*` environment variables
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BSP_JOB_ID") {
            self.job_id = v;
        }
        if let Some(v) = lookup("BSP_HOSTNAME") {
            self.hostname = v;
        }
        if let Some(v) = lookup("BSP_PARTITION_ID") {
            self.partition_id = parse_var("BSP_PARTITION_ID", &v)?;
        }
        if let Some(v) = lookup("BSP_MAX_WORKERS") {
            self.health.max_workers = parse_var("BSP_MAX_WORKERS", &v)?;
        }
        if let Some(v) = lookup("BSP_MIN_WORKERS") {
            self.health.min_workers = parse_var("BSP_MIN_WORKERS", &v)?;
        }
        if let Some(v) = lookup("BSP_MIN_PERCENT_RESPONDED") {
            self.health.min_percent_responded = parse_var("BSP_MIN_PERCENT_RESPONDED", &v)?;
        }
        if let Some(v) = lookup("BSP_POLL_PERIOD_MS") {
            self.health.poll_period = Duration::from_millis(parse_var("BSP_POLL_PERIOD_MS", &v)?);
        }
        if let Some(v) = lookup("BSP_MAX_POLL_ATTEMPTS") {
            self.health.max_poll_attempts = parse_var("BSP_MAX_POLL_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("BSP_CHECKPOINT_FREQUENCY") {
            self.checkpoint.frequency = parse_var("BSP_CHECKPOINT_FREQUENCY", &v)?;
        }
        if let Some(v) = lookup("BSP_CHECKPOINT_PATH") {
            self.checkpoint.base_path = v;
        }
        if let Some(v) = lookup("BSP_CLEANUP_CHECKPOINTS") {
            self.checkpoint.cleanup_after_success = parse_bool("BSP_CLEANUP_CHECKPOINTS", &v)?;
        }
        if let Some(v) = lookup("BSP_STORAGE_ROOT") {
            self.storage = StorageConfig::Local {
                root: PathBuf::from(v),
            };
        }
        if let Some(v) = lookup("BSP_BALANCER") {
            self.balancer = parse_var("BSP_BALANCER", &v)?;
        }
        if let Some(v) = lookup("BSP_TOTAL_VERTICES") {
            self.input.total_vertices = parse_var("BSP_TOTAL_VERTICES", &v)?;
        }
        if let Some(v) = lookup("BSP_SPLITS_PER_WORKER") {
            self.input.splits_per_worker = parse_var("BSP_SPLITS_PER_WORKER", &v)?;
        }
        if let Some(v) = lookup("BSP_RESTART_SUPERSTEP") {
            let restart: i64 = parse_var("BSP_RESTART_SUPERSTEP", &v)?;
            if restart < 0 {
                return Err(BspError::InvalidConfig {
                    reason: format!("restart superstep {} is negative", restart),
                });
            }
            self.restart_superstep = Some(restart as u64);
        }
        if let Some(v) = lookup("BSP_MAX_RESTART_ATTEMPTS") {
            self.max_restart_attempts = parse_var("BSP_MAX_RESTART_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("BSP_KEEP_COORDINATION_DATA") {
            self.keep_coordination_data = parse_bool("BSP_KEEP_COORDINATION_DATA", &v)?;
        }
        if let Some(v) = lookup("BSP_EXPECTED_CLEANUP_TASKS") {
            self.expected_cleanup_tasks = parse_var("BSP_EXPECTED_CLEANUP_TASKS", &v)?;
        }
        Ok(self)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(BspError::InvalidConfig { reason });

        if self.job_id.is_empty() || self.job_id.contains('/') {
            return invalid(format!("job id '{}' must be non-empty without '/'", self.job_id));
        }
        if self.hostname.is_empty() || self.hostname.contains('/') {
            return invalid(format!(
                "hostname '{}' must be non-empty without '/'",
                self.hostname
            ));
        }
        self.health.validate()?;
        if self.expected_cleanup_tasks == 0 {
            return invalid("expected_cleanup_tasks must be at least 1".into());
        }
        if self.checkpoint.base_path.is_empty() {
            return invalid("checkpoint base path must be set".into());
        }
        self.input.validate()
    }

    /// Worker id of this master
    pub fn master_id(&self) -> String {
        graph::worker_id(&self.hostname, self.partition_id)
    }

    /// Load, override and validate in one step
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = base.with_env_overrides()?;
        config.validate()?;
        info!(
            "Loaded config for job {} (workers {}..={}, checkpoint every {})",
            config.job_id,
            config.health.min_workers,
            config.health.max_workers,
            config.checkpoint.frequency
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_is_valid() {
        MasterConfig::default().validate().unwrap();
    }

    #[test]
    fn test_overrides() {
        let config = MasterConfig::default()
            .apply_overrides(lookup(&[
                ("BSP_JOB_ID", "pagerank"),
                ("BSP_MAX_WORKERS", "8"),
                ("BSP_MIN_WORKERS", "6"),
                ("BSP_POLL_PERIOD_MS", "250"),
                ("BSP_BALANCER", "round_robin"),
                ("BSP_KEEP_COORDINATION_DATA", "true"),
                ("BSP_RESTART_SUPERSTEP", "4"),
            ]))
            .unwrap();
        assert_eq!(config.job_id, "pagerank");
        assert_eq!(config.health.max_workers, 8);
        assert_eq!(config.health.poll_period, Duration::from_millis(250));
        assert_eq!(config.balancer, BalancerKind::RoundRobin);
        assert!(config.keep_coordination_data);
        assert_eq!(config.restart_superstep, Some(4));
        config.validate().unwrap();
    }

    #[test]
    fn test_negative_restart_rejected() {
        let result =
            MasterConfig::default().apply_overrides(lookup(&[("BSP_RESTART_SUPERSTEP", "-2")]));
        assert!(matches!(result, Err(BspError::InvalidConfig { .. })));
    }

    #[test]
    fn test_inconsistent_workers_rejected() {
        let mut config = MasterConfig::default();
        config.health.min_workers = config.health.max_workers + 1;
        assert!(config.validate().is_err());

        let mut config = MasterConfig::default();
        config.job_id = "a/b".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_with_partial_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"job_id":"cc","health":{{"max_workers":5,"poll_period":"2s"}},
                "storage":{{"backend":"local","root":"/tmp/ck"}}}}"#
        )
        .unwrap();
        let config = MasterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.job_id, "cc");
        assert_eq!(config.health.max_workers, 5);
        assert_eq!(config.health.poll_period, Duration::from_secs(2));
        assert_eq!(config.max_restart_attempts, 3);
        assert!(matches!(config.storage, StorageConfig::Local { .. }));
    }
}
