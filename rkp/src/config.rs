use anyhow::{Context, Result};
use common::Manifest;
use gethostname::gethostname;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::presence::RetryPolicy;
use crate::service::LifecycleTiming;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Xline endpoints and session settings
    pub xline_config: XlineConfig,
    // Overrides the kernel hostname in presence records.
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_appevents_dir")]
    pub appevents_dir: PathBuf,
    #[serde(default = "default_cgroup_memory_root")]
    pub cgroup_memory_root: PathBuf,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Lease TTL in seconds; ephemeral records vanish this long after the
    /// agent stops refreshing its session.
    #[serde(default = "default_session_ttl")]
    pub session_ttl: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub ephemeral_retry_attempts: u32,
    pub ephemeral_retry_interval_secs: u64,
    pub supervisor_poll_interval_ms: u64,
    pub exit_settle_ms: u64,
    pub supervisor_attach_timeout_secs: Option<u64>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            ephemeral_retry_attempts: 5,
            ephemeral_retry_interval_secs: 5,
            supervisor_poll_interval_ms: 500,
            exit_settle_ms: 1000,
            supervisor_attach_timeout_secs: None,
        }
    }
}

impl TimingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.ephemeral_retry_attempts.max(1),
            interval: Duration::from_secs(self.ephemeral_retry_interval_secs),
        }
    }

    pub fn lifecycle_timing(&self) -> LifecycleTiming {
        LifecycleTiming {
            poll_interval: Duration::from_millis(self.supervisor_poll_interval_ms),
            exit_settle: Duration::from_millis(self.exit_settle_ms),
            attach_timeout: self.supervisor_attach_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl Config {
    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .unwrap_or_else(|| gethostname().to_string_lossy().into_owned())
    }
}

fn default_appevents_dir() -> PathBuf {
    PathBuf::from("/var/lib/rkp/appevents")
}

fn default_cgroup_memory_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/memory")
}

fn default_session_ttl() -> i64 {
    30
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}

pub fn load_manifest(path: &str) -> Result<Manifest> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read manifest from {path}"))?;
    Manifest::from_yaml_str(&content).with_context(|| format!("Failed to parse manifest {path}"))
}
