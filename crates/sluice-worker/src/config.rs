// Worker configuration loaded from the environment

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sluice::{OverflowPolicy, RetryPolicy};
use tracing::warn;
use uuid::Uuid;

/// Sizing and overflow behavior for one group of stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSettings {
    pub workers: usize,
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

/// Synthetic load shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Total tasks to submit
    pub tasks: u64,
    /// Tasks submitted back to back before pausing
    pub burst: u64,
    /// Pause between bursts
    pub interval: Duration,
    /// Fixed RNG seed for a reproducible mix
    pub seed: Option<u64>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            tasks: 1_000,
            burst: 100,
            interval: Duration::from_millis(50),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker ID (unique identifier for this process)
    pub worker_id: String,
    /// Ingress stage (`intake`)
    pub ingress: StageSettings,
    /// Internal stages (`expand`, `persist`)
    pub stages: StageSettings,
    /// Most submissions one batch may expand into (`None` = unbounded)
    pub max_fan_out: Option<usize>,
    /// Per-task deadline applied at submission (`None` = no deadline)
    pub task_timeout: Option<Duration>,
    /// How long shutdown waits for the drain
    pub shutdown_timeout: Duration,
    /// Simulated latency of one record store write
    pub write_latency: Duration,
    /// Attempts per submission when the ingress is full
    pub submit_attempts: u32,
    pub load: LoadConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("sluice-worker-{}", Uuid::now_v7()),
            ingress: StageSettings {
                workers: 4,
                capacity: 64,
                policy: OverflowPolicy::RejectImmediately,
            },
            stages: StageSettings {
                workers: 4,
                capacity: 128,
                policy: OverflowPolicy::Block,
            },
            max_fan_out: Some(32),
            task_timeout: Some(Duration::from_secs(30)),
            shutdown_timeout: Duration::from_secs(10),
            write_latency: Duration::from_millis(2),
            submit_attempts: 3,
            load: LoadConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup
    ///
    /// Missing keys keep their defaults; unparsable values log a warning
    /// and keep their defaults too.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env { lookup };

        let worker_id = env
            .raw("SLUICE_WORKER_ID")
            .unwrap_or(defaults.worker_id);

        let ingress = StageSettings {
            workers: env.parse("SLUICE_INGRESS_WORKERS", defaults.ingress.workers),
            capacity: env.parse("SLUICE_INGRESS_CAPACITY", defaults.ingress.capacity),
            policy: env.parse("SLUICE_INGRESS_POLICY", defaults.ingress.policy),
        };

        let stages = StageSettings {
            workers: env.parse("SLUICE_STAGE_WORKERS", defaults.stages.workers),
            capacity: env.parse("SLUICE_STAGE_CAPACITY", defaults.stages.capacity),
            ..defaults.stages
        };

        let max_fan_out = env.optional("SLUICE_MAX_FAN_OUT", defaults.max_fan_out);
        let task_timeout = env
            .optional(
                "SLUICE_TASK_TIMEOUT_MS",
                defaults.task_timeout.map(duration_millis),
            )
            .map(Duration::from_millis);

        let load = LoadConfig {
            tasks: env.parse("SLUICE_LOAD_TASKS", defaults.load.tasks),
            burst: env.parse("SLUICE_LOAD_BURST", defaults.load.burst).max(1),
            interval: env.millis("SLUICE_LOAD_INTERVAL_MS", defaults.load.interval),
            seed: env.optional("SLUICE_LOAD_SEED", defaults.load.seed),
        };

        Self {
            worker_id,
            ingress,
            stages,
            max_fan_out,
            task_timeout,
            shutdown_timeout: env.millis("SLUICE_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout),
            write_latency: env.millis("SLUICE_WRITE_LATENCY_MS", defaults.write_latency),
            submit_attempts: env
                .parse("SLUICE_SUBMIT_ATTEMPTS", defaults.submit_attempts)
                .max(1),
            load,
        }
    }

    /// Retry policy for ingress rejections
    pub fn submit_retry(&self) -> RetryPolicy {
        if self.submit_attempts <= 1 {
            RetryPolicy::no_retry()
        } else {
            RetryPolicy::exponential().with_max_attempts(self.submit_attempts)
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + Display,
        T::Err: Display,
    {
        let Some(raw) = self.raw(key) else {
            return default;
        };
        match raw.parse() {
            Ok(value) => value,
            Err(e) => {
                warn!(key, value = %raw, error = %e, %default, "Invalid setting, using default");
                default
            }
        }
    }

    /// `0` or `none` disables the limit
    fn optional<T>(&self, key: &str, default: Option<T>) -> Option<T>
    where
        T: FromStr + Display + PartialEq + Default,
        T::Err: Display,
    {
        let Some(raw) = self.raw(key) else {
            return default;
        };
        if raw.eq_ignore_ascii_case("none") {
            return None;
        }
        match raw.parse::<T>() {
            Ok(value) if value == T::default() => None,
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, value = %raw, error = %e, "Invalid setting, using default");
                default
            }
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parse(key, duration_millis(default)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> WorkerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let config = config_from(&[]);
        let defaults = WorkerConfig::default();

        assert!(config.worker_id.starts_with("sluice-worker-"));
        assert_eq!(config.ingress, defaults.ingress);
        assert_eq!(config.stages, defaults.stages);
        assert_eq!(config.ingress.policy, OverflowPolicy::RejectImmediately);
        assert_eq!(config.stages.policy, OverflowPolicy::Block);
        assert_eq!(config.max_fan_out, Some(32));
        assert_eq!(config.task_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.load, LoadConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("SLUICE_WORKER_ID", "ingest-a"),
            ("SLUICE_INGRESS_WORKERS", "2"),
            ("SLUICE_INGRESS_CAPACITY", "8"),
            ("SLUICE_INGRESS_POLICY", "drop-oldest"),
            ("SLUICE_STAGE_WORKERS", "6"),
            ("SLUICE_STAGE_CAPACITY", "12"),
            ("SLUICE_MAX_FAN_OUT", "5"),
            ("SLUICE_TASK_TIMEOUT_MS", "250"),
            ("SLUICE_SHUTDOWN_TIMEOUT_MS", "1500"),
            ("SLUICE_WRITE_LATENCY_MS", "0"),
            ("SLUICE_SUBMIT_ATTEMPTS", "1"),
            ("SLUICE_LOAD_TASKS", "40"),
            ("SLUICE_LOAD_BURST", "10"),
            ("SLUICE_LOAD_INTERVAL_MS", "5"),
            ("SLUICE_LOAD_SEED", "7"),
        ]);

        assert_eq!(config.worker_id, "ingest-a");
        assert_eq!(
            config.ingress,
            StageSettings {
                workers: 2,
                capacity: 8,
                policy: OverflowPolicy::DropOldest,
            }
        );
        assert_eq!(config.stages.workers, 6);
        assert_eq!(config.stages.capacity, 12);
        assert_eq!(config.max_fan_out, Some(5));
        assert_eq!(config.task_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(1500));
        assert_eq!(config.write_latency, Duration::ZERO);
        assert_eq!(config.submit_attempts, 1);
        assert_eq!(config.load.tasks, 40);
        assert_eq!(config.load.burst, 10);
        assert_eq!(config.load.interval, Duration::from_millis(5));
        assert_eq!(config.load.seed, Some(7));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_from(&[
            ("SLUICE_INGRESS_WORKERS", "many"),
            ("SLUICE_INGRESS_POLICY", "lifo"),
            ("SLUICE_SHUTDOWN_TIMEOUT_MS", "-3"),
            ("SLUICE_MAX_FAN_OUT", "lots"),
        ]);
        let defaults = WorkerConfig::default();

        assert_eq!(config.ingress.workers, defaults.ingress.workers);
        assert_eq!(config.ingress.policy, defaults.ingress.policy);
        assert_eq!(config.shutdown_timeout, defaults.shutdown_timeout);
        assert_eq!(config.max_fan_out, defaults.max_fan_out);
    }

    #[test]
    fn test_zero_disables_limits() {
        let config = config_from(&[
            ("SLUICE_MAX_FAN_OUT", "0"),
            ("SLUICE_TASK_TIMEOUT_MS", "none"),
        ]);
        assert_eq!(config.max_fan_out, None);
        assert_eq!(config.task_timeout, None);
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let config = config_from(&[("SLUICE_WORKER_ID", "  "), ("SLUICE_LOAD_BURST", "")]);
        assert!(config.worker_id.starts_with("sluice-worker-"));
        assert_eq!(config.load.burst, LoadConfig::default().burst);
    }

    #[test]
    fn test_submit_retry() {
        let single = config_from(&[("SLUICE_SUBMIT_ATTEMPTS", "1")]);
        assert_eq!(single.submit_retry().max_attempts, 1);

        let several = config_from(&[("SLUICE_SUBMIT_ATTEMPTS", "4")]);
        assert_eq!(several.submit_retry().max_attempts, 4);
    }
}
