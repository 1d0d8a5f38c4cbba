use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Store configuration: dispatch reconciliation timing and gap retry budget.
///
/// Loaded from a TOML file or from environment variables; every field has a
/// default so partial files are fine.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub dispatch: DispatchConfig,
    pub gap_retry: GapRetryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// How often the control scans for unconfirmed dispatchables.
    pub check_interval_ms: u64,
    /// Age after which an unconfirmed dispatchable is redelivered.
    pub confirmation_expiration_ms: u64,
    /// Delay before the first scan after startup.
    pub redispatch_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1_000,
            confirmation_expiration_ms: 1_000,
            redispatch_delay_ms: 2_000,
        }
    }
}

impl DispatchConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn confirmation_expiration(&self) -> Duration {
        Duration::from_millis(self.confirmation_expiration_ms)
    }

    pub fn redispatch_delay(&self) -> Duration {
        Duration::from_millis(self.redispatch_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GapRetryConfig {
    pub retries: u32,
    pub retry_interval_ms: u64,
}

impl Default for GapRetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_interval_ms: 10,
        }
    }
}

impl GapRetryConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl StoreConfig {
    /// Load and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Defaults overridden by `STOWAGE_*` environment variables.
    ///
    /// - `STOWAGE_DISPATCH_CHECK_INTERVAL_MS`
    /// - `STOWAGE_CONFIRMATION_EXPIRATION_MS`
    /// - `STOWAGE_REDISPATCH_DELAY_MS`
    /// - `STOWAGE_GAP_RETRIES`
    /// - `STOWAGE_GAP_RETRY_INTERVAL_MS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`StoreConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let dispatch = &mut config.dispatch;
        override_with(&lookup, "STOWAGE_DISPATCH_CHECK_INTERVAL_MS", &mut dispatch.check_interval_ms)?;
        override_with(
            &lookup,
            "STOWAGE_CONFIRMATION_EXPIRATION_MS",
            &mut dispatch.confirmation_expiration_ms,
        )?;
        override_with(&lookup, "STOWAGE_REDISPATCH_DELAY_MS", &mut dispatch.redispatch_delay_ms)?;

        let gap_retry = &mut config.gap_retry;
        override_with(&lookup, "STOWAGE_GAP_RETRIES", &mut gap_retry.retries)?;
        override_with(&lookup, "STOWAGE_GAP_RETRY_INTERVAL_MS", &mut gap_retry.retry_interval_ms)?;

        Ok(config)
    }
}

fn override_with<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}"))?;
    }
    Ok(())
}
