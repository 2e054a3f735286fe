use std::{path::Path, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::error::CdaiResult;

/// Read-only settings consumed by the placement engine and the fulfillment
/// pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CdaiConfig {
    /// Tolerance absorbing the slack between source fragment timing and the
    /// declared ad durations.
    pub align_factor_ms: u64,
    /// Periods at or below this duration are not usable for ad playback.
    pub tiny_period_ms: u64,
    /// Default wait used by `wait_for_next_ad_resolved`.
    pub ad_fulfill_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Base URL of the local recording proxy. Ad manifests are requested
    /// through it when set.
    pub recording_proxy: Option<Url>,
}

impl Default for CdaiConfig {
    fn default() -> Self {
        Self {
            align_factor_ms: 2000,
            tiny_period_ms: 500,
            ad_fulfill_timeout_ms: 3000,
            request_timeout_ms: 10000,
            recording_proxy: None,
        }
    }
}

impl CdaiConfig {
    pub fn from_toml_str(data: &str) -> CdaiResult<Self> {
        Ok(toml::from_str(data)?)
    }

    pub fn load(path: impl AsRef<Path>) -> CdaiResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_toml_str(&data)
    }

    pub fn ad_fulfill_timeout(&self) -> Duration {
        Duration::from_millis(self.ad_fulfill_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Floors `offset_ms` to a multiple of the alignment factor.
    pub(crate) fn align_floor(&self, offset_ms: u64) -> u64 {
        if self.align_factor_ms == 0 {
            return offset_ms;
        }
        offset_ms - offset_ms % self.align_factor_ms
    }
}
