//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on values that do not parse.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::autoscale::AutoscalePolicy;
use crate::engine::DispatchConfig;
use crate::error::{Error, Result};
use crate::reclaim::ReclaimConfig;
use secrets::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Bounds and starting point of the concurrency ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CeilingBounds {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
}

#[derive(Debug)]
pub struct Config {
    /// Required unless running with an in-memory ledger.
    pub database_url: Option<SecretString>,
    pub database_max_connections: u32,
    /// Shared key for identity assertions. When set, every event must carry one.
    pub gate_signing_key: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub policy_file: PathBuf,
    pub template_dir: PathBuf,
    /// Working directories for the process backend.
    pub task_dir: PathBuf,
    pub ceiling: CeilingBounds,
    pub dispatch: DispatchConfig,
    pub reclaim: ReclaimConfig,
    pub autoscale: AutoscalePolicy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(&lookup);

        let min = vars.parsed("DISPATCH_CEILING_MIN", 0usize)?;
        let max = vars.parsed("DISPATCH_CEILING_MAX", 8usize)?;
        if min > max {
            return Err(Error::Config(format!(
                "DISPATCH_CEILING_MIN ({min}) exceeds DISPATCH_CEILING_MAX ({max})"
            )));
        }
        let initial = vars.parsed("DISPATCH_CEILING_INITIAL", min)?;

        let autoscale_defaults = AutoscalePolicy::default();
        let autoscale = AutoscalePolicy {
            target_cpu_pct: vars
                .percent("AUTOSCALE_TARGET_CPU_PCT", autoscale_defaults.target_cpu_pct)?,
            target_mem_pct: vars
                .percent("AUTOSCALE_TARGET_MEM_PCT", autoscale_defaults.target_mem_pct)?,
            step: vars.parsed("AUTOSCALE_STEP", autoscale_defaults.step)?,
            tick_interval: vars
                .seconds("AUTOSCALE_TICK_SECS", autoscale_defaults.tick_interval)?,
        };
        if autoscale.step == 0 {
            return Err(Error::Config("AUTOSCALE_STEP must be at least 1".to_string()));
        }

        let dispatch_defaults = DispatchConfig::default();
        let reclaim_defaults = ReclaimConfig::default();

        Ok(Self {
            database_url: vars.get("DATABASE_URL").map(SecretString::from),
            database_max_connections: vars.parsed("DATABASE_MAX_CONNECTIONS", 10u32)?,
            gate_signing_key: vars.get("GATE_SIGNING_KEY").map(SecretString::from),
            otel_endpoint: vars.get("OTEL_ENDPOINT"),
            log_level: vars.get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            policy_file: vars
                .get("DISPATCH_POLICY_FILE")
                .map_or_else(|| PathBuf::from("policy.toml"), PathBuf::from),
            template_dir: vars
                .get("DISPATCH_TEMPLATE_DIR")
                .map_or_else(|| PathBuf::from("templates"), PathBuf::from),
            task_dir: vars
                .get("DISPATCH_TASK_DIR")
                .map_or_else(|| std::env::temp_dir().join("dispatchd-tasks"), PathBuf::from),
            ceiling: CeilingBounds { initial, min, max },
            dispatch: DispatchConfig {
                retry_ceiling: vars
                    .parsed("DISPATCH_RETRY_CEILING", dispatch_defaults.retry_ceiling)?,
                launch_timeout: vars.seconds(
                    "DISPATCH_LAUNCH_TIMEOUT_SECS",
                    dispatch_defaults.launch_timeout,
                )?,
                ..dispatch_defaults
            },
            reclaim: ReclaimConfig {
                execution_timeout: vars.seconds(
                    "DISPATCH_EXECUTION_TIMEOUT_SECS",
                    reclaim_defaults.execution_timeout,
                )?,
                launch_stall_timeout: vars.seconds(
                    "DISPATCH_LAUNCH_STALL_SECS",
                    reclaim_defaults.launch_stall_timeout,
                )?,
                ..reclaim_defaults
            },
            autoscale,
        })
    }

    /// The database URL, or a configuration error naming the variable.
    pub fn require_database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T: FromStr>(&self, name: &str, default: T) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("{name}={raw}: {e}"))),
            None => Ok(default),
        }
    }

    fn seconds(&self, name: &str, default: Duration) -> Result<Duration> {
        let secs = self.parsed(name, default.as_secs())?;
        Ok(Duration::from_secs(secs))
    }

    fn percent(&self, name: &str, default: f64) -> Result<f64> {
        let pct: f64 = self.parsed(name, default)?;
        if !(0.0..=100.0).contains(&pct) {
            return Err(Error::Config(format!("{name}={pct}: must be within 0..=100")));
        }
        Ok(pct)
    }
}
