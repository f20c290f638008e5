/// Configuration for the tree service and its stores
use crate::db::{SortKeyAllocator, DEFAULT_SORT_GAP};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ENV_SORT_GAP: &str = "PAGETREE_SORT_GAP";
pub const ENV_CONFLICT_RETRIES: &str = "PAGETREE_CONFLICT_RETRIES";
pub const ENV_OPERATION_TIMEOUT_MS: &str = "PAGETREE_OPERATION_TIMEOUT_MS";

/// Upper bound on conflict retries; anything above this is a livelock, not contention
const MAX_CONFLICT_RETRIES: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Distance between consecutive sort keys on append and renumber
    pub sort_gap: i64,

    /// How often an operation is re-run after losing a sort key race
    pub conflict_retries: u32,

    /// Per-operation deadline; `None` waits indefinitely
    pub operation_timeout_ms: Option<u64>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            sort_gap: DEFAULT_SORT_GAP,
            conflict_retries: 1,
            operation_timeout_ms: None,
        }
    }
}

impl TreeConfig {
    /// Defaults overridden by `PAGETREE_*` environment variables.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_SORT_GAP) {
            config.sort_gap = parse_var(ENV_SORT_GAP, &value)?;
        }
        if let Some(value) = lookup(ENV_CONFLICT_RETRIES) {
            config.conflict_retries = parse_var(ENV_CONFLICT_RETRIES, &value)?;
        }
        if let Some(value) = lookup(ENV_OPERATION_TIMEOUT_MS) {
            config.operation_timeout_ms = Some(parse_var(ENV_OPERATION_TIMEOUT_MS, &value)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.sort_gap < 2 {
            return Err(format!("sort_gap must be at least 2, got {}", self.sort_gap));
        }

        if self.conflict_retries > MAX_CONFLICT_RETRIES {
            return Err(format!(
                "conflict_retries cannot exceed {}",
                MAX_CONFLICT_RETRIES
            ));
        }

        if self.operation_timeout_ms == Some(0) {
            return Err("operation_timeout_ms must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Allocator to hand to a store so its keys follow `sort_gap`.
    pub fn allocator(&self) -> SortKeyAllocator {
        SortKeyAllocator::new(self.sort_gap)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("{} has an invalid value: '{}'", key, value))
}
