//! `PoolConfig` and its layered loading: defaults → TOML file → env
//! overrides prefixed `SUBAGENT_` (spec §3). Secrets never travel through
//! this layer — `llm_api_key_env` only names the host env var to read, and
//! the CLI reads it directly with `std::env::var`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Image pull policy, spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl Default for PullPolicy {
    fn default() -> Self {
        PullPolicy::IfNotPresent
    }
}

fn default_task_timeout_s() -> u64 {
    30
}
fn default_container_count() -> u32 {
    1
}
fn default_memory_limit() -> String {
    "512m".to_string()
}
fn default_cpu_limit() -> f64 {
    1.0
}
fn default_pids_limit() -> u32 {
    50
}
fn default_max_tasks_per_minute() -> u32 {
    60
}
fn default_circuit_breaker_threshold() -> u32 {
    5
}
fn default_circuit_breaker_timeout_s() -> u64 {
    30
}
fn default_health_check_interval_s() -> u64 {
    30
}
fn default_max_pending_per_container() -> usize {
    100
}
fn default_inspect_ttl_s() -> u64 {
    5
}
fn default_skills_mount_path() -> String {
    "/workspace/skills".to_string()
}
fn default_image() -> String {
    "subagent-worker:latest".to_string()
}

/// Host-side and container-side configuration for a [`crate::pool::Pool`].
///
/// Every field enumerated in spec §3. Deserializes from TOML via the
/// `config` crate; an env var `SUBAGENT_<FIELD>` (e.g. `SUBAGENT_IMAGE`)
/// overrides the file value, which overrides the built-in default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub image: String,

    #[serde(rename = "task_timeout_s")]
    pub task_timeout_s: u64,

    /// Default 1; 0 means on-demand mode — no pre-warmed workers, workers
    /// are destroyed (not idled) on release.
    pub container_count: u32,

    /// e.g. `"512m"`, `"1g"`; parsed to bytes by the container adapter.
    pub memory_limit: String,

    /// Fractional CPUs; converted to nanocpus (`cpu_limit * 1e9`) by the
    /// container adapter.
    pub cpu_limit: f64,

    pub pids_limit: u32,

    pub pull_policy: PullPolicy,

    pub max_tasks_per_minute: u32,

    pub circuit_breaker_threshold: u32,

    #[serde(rename = "circuit_breaker_timeout_s")]
    pub circuit_breaker_timeout_s: u64,

    #[serde(rename = "health_check_interval_s")]
    pub health_check_interval_s: u64,

    pub max_pending_per_container: usize,

    #[serde(rename = "inspect_ttl_s")]
    pub inspect_ttl_s: u64,

    pub security_opts: Vec<String>,

    pub readonly_rootfs: bool,

    pub skills_mount_path: String,

    /// *Name* of the host env var holding the LLM API key. The key itself
    /// is read host-side and handed to the worker over the protocol only —
    /// never forwarded into the container environment.
    pub llm_api_key_env: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            task_timeout_s: default_task_timeout_s(),
            container_count: default_container_count(),
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            pids_limit: default_pids_limit(),
            pull_policy: PullPolicy::default(),
            max_tasks_per_minute: default_max_tasks_per_minute(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_timeout_s: default_circuit_breaker_timeout_s(),
            health_check_interval_s: default_health_check_interval_s(),
            max_pending_per_container: default_max_pending_per_container(),
            inspect_ttl_s: default_inspect_ttl_s(),
            security_opts: vec!["no-new-privileges".to_string()],
            readonly_rootfs: false,
            skills_mount_path: default_skills_mount_path(),
            llm_api_key_env: None,
        }
    }
}

impl PoolConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_s)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout_s)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_s)
    }

    pub fn inspect_ttl(&self) -> Duration {
        Duration::from_secs(self.inspect_ttl_s)
    }

    /// `container_count == 0` is the on-demand-mode flag throughout the
    /// pool (spec §9 open question resolution).
    pub fn is_on_demand(&self) -> bool {
        self.container_count == 0
    }

    /// Parses `memory_limit`'s `g`/`m`/`k` suffix into bytes, per spec
    /// §4.3.
    pub fn memory_limit_bytes(&self) -> Result<i64, String> {
        parse_memory_limit(&self.memory_limit)
    }

    /// Loads configuration layered defaults → TOML file → env overrides
    /// prefixed `SUBAGENT_`, via the `config` crate.
    pub fn load(file_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&PoolConfig::default())?);

        if let Some(path) = file_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SUBAGENT")
                .separator("_")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

fn parse_memory_limit(s: &str) -> Result<i64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty memory limit".to_string());
    }
    let (digits, suffix) = s.split_at(s.len() - 1);
    let multiplier: i64 = match suffix.to_ascii_lowercase().as_str() {
        "g" => 1024 * 1024 * 1024,
        "m" => 1024 * 1024,
        "k" => 1024,
        _ => {
            return s
                .parse::<i64>()
                .map_err(|e| format!("invalid memory limit {s:?}: {e}"));
        }
    };
    digits
        .parse::<i64>()
        .map(|n| n * multiplier)
        .map_err(|e| format!("invalid memory limit {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.container_count, 1);
        assert_eq!(cfg.circuit_breaker_threshold, 5);
        assert_eq!(cfg.circuit_breaker_timeout_s, 30);
        assert_eq!(cfg.health_check_interval_s, 30);
        assert_eq!(cfg.max_pending_per_container, 100);
        assert_eq!(cfg.inspect_ttl_s, 5);
        assert_eq!(cfg.skills_mount_path, "/workspace/skills");
        assert!(!cfg.is_on_demand());
    }

    #[test]
    fn container_count_zero_is_on_demand() {
        let mut cfg = PoolConfig::default();
        cfg.container_count = 0;
        assert!(cfg.is_on_demand());
    }

    #[test]
    fn memory_limit_parses_suffixes() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("256k").unwrap(), 256 * 1024);
        assert_eq!(parse_memory_limit("128").unwrap(), 128);
    }

    #[test]
    fn memory_limit_rejects_garbage() {
        assert!(parse_memory_limit("").is_err());
        assert!(parse_memory_limit("abc").is_err());
    }

    #[test]
    fn load_without_file_returns_defaults() {
        let cfg = PoolConfig::load(None).expect("loads defaults");
        assert_eq!(cfg.container_count, 1);
    }
}
