use std::time::Duration;

use anyhow::{bail, Result};
use compare_kernel_core::DEFAULT_SELECTION_PARAM;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SLOT_KEY: &str = "compare.selection";
pub const DEFAULT_BASE_ADDRESS: &str = "";
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

/// Knobs for one [`crate::CompareEngine`] session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Durable slot holding the serialized selection.
    pub slot_key: String,
    /// Query parameter carrying the selection in shareable addresses.
    pub address_param: String,
    /// Address used until the session navigates somewhere else.
    pub base_address: String,
    pub fetch_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_key: DEFAULT_SLOT_KEY.to_string(),
            address_param: DEFAULT_SELECTION_PARAM.to_string(),
            base_address: DEFAULT_BASE_ADDRESS.to_string(),
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// # Errors
    /// Returns an error when the slot key or parameter name is empty, the parameter name carries
    /// query syntax, or the fetch timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.slot_key.trim().is_empty() {
            bail!("slot_key MUST be non-empty");
        }
        if self.address_param.is_empty() {
            bail!("address_param MUST be non-empty");
        }
        if self
            .address_param
            .chars()
            .any(|c| matches!(c, '?' | '&' | '=' | '#') || c.is_whitespace())
        {
            bail!("address_param MUST NOT contain '?', '&', '=', '#' or whitespace");
        }
        if self.fetch_timeout_ms == 0 {
            bail!("fetch_timeout_ms MUST be greater than zero");
        }
        Ok(())
    }
}
