use serde::Serialize;

use crate::error::AdErrorKind;

/// Outcome of one ad announcement or fulfillment, reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdResolvedEvent {
    pub ad_id: String,
    pub success: bool,
    /// Position of the ad inside its break.
    pub start_ms: u64,
    pub duration_ms: u64,
    pub error: AdErrorKind,
}

impl AdResolvedEvent {
    pub fn resolved(ad_id: &str, start_ms: u64, duration_ms: u64) -> Self {
        Self {
            ad_id: ad_id.to_string(),
            success: true,
            start_ms,
            duration_ms,
            error: AdErrorKind::None,
        }
    }

    pub fn failed(ad_id: &str, error: AdErrorKind) -> Self {
        Self {
            ad_id: ad_id.to_string(),
            success: false,
            start_ms: 0,
            duration_ms: 0,
            error,
        }
    }
}
