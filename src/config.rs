//! Simulation configuration.
//!
//! Values come from (lowest to highest precedence) built-in defaults, a JSON
//! document, and `LOOPER_SIM_*` environment variables.

use crate::error::{Error, Result};
use crate::scheduler::IdleState;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Virtual start time of every fresh scheduler, in milliseconds.
pub const DEFAULT_START_TIME_MS: u64 = 100;
/// Upper bound on tasks run by a single `run_to_end_of_tasks` call.
pub const DEFAULT_DRAIN_LIMIT: usize = 1_000_000;

pub const ENV_START_TIME_MS: &str = "LOOPER_SIM_START_TIME_MS";
pub const ENV_GLOBAL_SCHEDULER: &str = "LOOPER_SIM_GLOBAL_SCHEDULER";
pub const ENV_IDLE_STATE: &str = "LOOPER_SIM_IDLE_STATE";
pub const ENV_BACKGROUND_PAUSED: &str = "LOOPER_SIM_BACKGROUND_PAUSED";
pub const ENV_RTC_EPOCH_MS: &str = "LOOPER_SIM_RTC_EPOCH_MS";
pub const ENV_DRAIN_LIMIT: &str = "LOOPER_SIM_DRAIN_LIMIT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Clock value of a freshly created or reset scheduler.
    pub start_time_ms: u64,
    /// Bind every non-main looper to the master scheduler.
    pub use_global_scheduler: bool,
    /// Idle state of a freshly created or reset scheduler.
    pub initial_idle_state: IdleState,
    /// Whether the background scheduler starts paused.
    pub background_paused: bool,
    /// Offset added to elapsed time to obtain RTC (wall-clock) time.
    pub rtc_epoch_ms: u64,
    pub drain_limit: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            start_time_ms: DEFAULT_START_TIME_MS,
            use_global_scheduler: false,
            initial_idle_state: IdleState::Unpaused,
            background_paused: true,
            rtc_epoch_ms: 0,
            drain_limit: DEFAULT_DRAIN_LIMIT,
        }
    }
}

impl SimConfig {
    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json_str(input: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        tracing::debug!(
            event = "config.load",
            path = %path.display(),
            "Loading simulation config"
        );
        Self::from_json_str(&raw)
    }

    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Self::default().with_overrides(lookup)
    }

    /// Apply `LOOPER_SIM_*` overrides on top of `self`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(ENV_START_TIME_MS) {
            self.start_time_ms = parse_u64(ENV_START_TIME_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_GLOBAL_SCHEDULER) {
            self.use_global_scheduler = parse_bool(ENV_GLOBAL_SCHEDULER, &raw)?;
        }
        if let Some(raw) = lookup(ENV_IDLE_STATE) {
            self.initial_idle_state = IdleState::parse(&raw).ok_or_else(|| {
                Error::config(format!("{ENV_IDLE_STATE}: unknown idle state {raw:?}"))
            })?;
        }
        if let Some(raw) = lookup(ENV_BACKGROUND_PAUSED) {
            self.background_paused = parse_bool(ENV_BACKGROUND_PAUSED, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RTC_EPOCH_MS) {
            self.rtc_epoch_ms = parse_u64(ENV_RTC_EPOCH_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_DRAIN_LIMIT) {
            let limit = parse_u64(ENV_DRAIN_LIMIT, &raw)?;
            self.drain_limit = usize::try_from(limit)
                .map_err(|_| Error::config(format!("{ENV_DRAIN_LIMIT}: {limit} is too large")))?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.drain_limit == 0 {
            return Err(Error::config("drain_limit must be > 0"));
        }
        Ok(())
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|err| Error::config(format!("{key}: invalid integer {raw:?}: {err}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{key}: invalid boolean {raw:?}"))),
    }
}
