//! Profiler configuration.
//!
//! Everything can be set from code, or picked up from the environment:
//! - `TAGALLOC_MODE`: `off` (0), `leak` (1, default), `all` (2) or
//!   `detailed` (3)
//! - `TAGALLOC_COMPACTION_THRESHOLD`: vacated ledger slots that trigger a
//!   compaction, positive integer, default 100
//! - `TAGALLOC_EXPANSION_RATIO`: ledger occupancy at or above which new slots
//!   are appended instead of recycled, in (0, 1), default 0.75

use std::{fmt, str::FromStr};

use log::warn;
use serde::Serialize;

use crate::{
    alloc::{ledger::DEFAULT_COMPACTION_THRESHOLD, reuse::DEFAULT_EXPANSION_RATIO},
    error::ConfigError,
};

pub const MODE_VAR: &str = "TAGALLOC_MODE";
pub const COMPACTION_THRESHOLD_VAR: &str = "TAGALLOC_COMPACTION_THRESHOLD";
pub const EXPANSION_RATIO_VAR: &str = "TAGALLOC_EXPANSION_RATIO";

/// How much the profiler records, and what it costs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileMode {
    /// Pass everything straight through to the raw heap
    Off,
    /// One ledger record per live allocation, recycled once freed
    #[default]
    LeakTracking,
    /// One ledger record per allocation ever made, kept for the whole run
    TrackAll,
    /// Per-tag buckets only, no per-allocation records
    Detailed,
}

impl ProfileMode {
    /// The numeric codes used by the C ABI and by `TAGALLOC_MODE`
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Off),
            1 => Some(Self::LeakTracking),
            2 => Some(Self::TrackAll),
            3 => Some(Self::Detailed),
            _ => None,
        }
    }

    pub const fn code(self) -> i32 {
        match self {
            Self::Off => 0,
            Self::LeakTracking => 1,
            Self::TrackAll => 2,
            Self::Detailed => 3,
        }
    }
}

impl FromStr for ProfileMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<i64>() {
            return Self::from_code(code).ok_or_else(|| ConfigError::UnknownMode(s.to_owned()));
        }
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" => Ok(Self::Off),
            "leak" | "leaks" | "leak-tracking" | "default" => Ok(Self::LeakTracking),
            "all" | "track-all" | "history" => Ok(Self::TrackAll),
            "detailed" | "aggregate" => Ok(Self::Detailed),
            _ => Err(ConfigError::UnknownMode(s.to_owned())),
        }
    }
}

impl fmt::Display for ProfileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::LeakTracking => "leak-tracking",
            Self::TrackAll => "track-all",
            Self::Detailed => "detailed",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ProfilerConfig {
    pub mode: ProfileMode,
    pub compaction_threshold: usize,
    pub expansion_ratio: f64,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            mode: ProfileMode::default(),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            expansion_ratio: DEFAULT_EXPANSION_RATIO,
        }
    }
}

impl ProfilerConfig {
    pub fn with_mode(mode: ProfileMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn expansion_ratio(mut self, ratio: f64) -> Self {
        self.expansion_ratio = ratio;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compaction_threshold == 0 {
            return Err(ConfigError::InvalidCompactionThreshold(
                self.compaction_threshold.to_string(),
            ));
        }
        // also rejects NaN
        if !(self.expansion_ratio > 0.0 && self.expansion_ratio < 1.0) {
            return Err(ConfigError::InvalidExpansionRatio(
                self.expansion_ratio.to_string(),
            ));
        }
        Ok(())
    }

    /// Read the configuration from the environment, failing on anything that
    /// is set but invalid
    pub fn from_env_strict() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`ProfilerConfig::from_env_strict()`], but an invalid setting is
    /// logged and replaced with its default
    pub fn from_env() -> Self {
        Self::from_lookup_lenient(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(MODE_VAR) {
            config.mode = raw.parse()?;
        }
        if let Some(raw) = lookup(COMPACTION_THRESHOLD_VAR) {
            config.compaction_threshold = parse_threshold(&raw)?;
        }
        if let Some(raw) = lookup(EXPANSION_RATIO_VAR) {
            config.expansion_ratio = parse_ratio(&raw)?;
        }
        Ok(config)
    }

    pub fn from_lookup_lenient<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(mode) = lenient(&lookup, MODE_VAR, str::parse::<ProfileMode>) {
            config.mode = mode;
        }
        if let Some(threshold) = lenient(&lookup, COMPACTION_THRESHOLD_VAR, parse_threshold) {
            config.compaction_threshold = threshold;
        }
        if let Some(ratio) = lenient(&lookup, EXPANSION_RATIO_VAR, parse_ratio) {
            config.expansion_ratio = ratio;
        }
        config
    }
}

fn lenient<T, F>(lookup: &F, key: &str, parse: fn(&str) -> Result<T, ConfigError>) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    parse(&raw)
        .map_err(|err| warn!(target: "tagalloc::config", "{key}: {err}, using the default"))
        .ok()
}

fn parse_threshold(raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(threshold) if threshold > 0 => Ok(threshold),
        _ => Err(ConfigError::InvalidCompactionThreshold(raw.to_owned())),
    }
}

fn parse_ratio(raw: &str) -> Result<f64, ConfigError> {
    match raw.trim().parse::<f64>() {
        Ok(ratio) if ratio > 0.0 && ratio < 1.0 => Ok(ratio),
        _ => Err(ConfigError::InvalidExpansionRatio(raw.to_owned())),
    }
}
