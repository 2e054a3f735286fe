use std::{collections::BTreeMap, sync::Arc};

use dash_mpd::MPD;
use serde::Serialize;

/// A position on the source timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelinePoint {
    pub period_id: String,
    pub offset_ms: u64,
}

impl TimelinePoint {
    pub fn new(period_id: impl Into<String>, offset_ms: u64) -> Self {
        Self {
            period_id: period_id.into(),
            offset_ms,
        }
    }
}

/// One ad creative inside a break.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdNode {
    pub ad_id: String,
    /// Manifest URL, possibly rewritten to the recording proxy.
    pub url: String,
    pub duration: u64,
    pub resolved: bool,
    /// Fulfillment failed or the ad landed on an unusable period. An invalid
    /// ad never becomes valid again.
    pub invalid: bool,
    pub placed: bool,
    /// Where playback switches from the source to this ad.
    pub base: Option<TimelinePoint>,
    #[serde(skip)]
    pub mpd: Option<Arc<MPD>>,
}

impl AdNode {
    pub(crate) fn announced(ad_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            ad_id: ad_id.into(),
            url: url.into(),
            ..Default::default()
        }
    }
}

/// One ad break, keyed by the source period that signaled it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdBreak {
    pub break_duration: u64,
    /// Play order.
    pub ads: Vec<AdNode>,
    /// Sum of the resolved ad durations, never above `break_duration`.
    pub ads_duration: u64,
    /// Set by a decisioning timeout, after which no ad is accepted.
    pub invalid: bool,
    /// At least one ad of the break has been resolved.
    pub resolved: bool,
    pub placed: bool,
    /// The ads run past the signaling period.
    pub split_period: bool,
    /// Where source playback resumes after the break.
    pub end: Option<TimelinePoint>,
}

impl AdBreak {
    pub fn new(break_duration: u64) -> Self {
        Self {
            break_duration,
            ..Default::default()
        }
    }

    pub fn ad_index(&self, ad_id: &str) -> Option<usize> {
        self.ads.iter().position(|ad| ad.ad_id == ad_id)
    }

    /// Duration of the ads from `ad_idx` on, minus what was already played of
    /// the first one.
    pub fn remaining_duration(&self, ad_idx: usize, start_offset: u64) -> u64 {
        self.ads
            .iter()
            .skip(ad_idx)
            .map(|ad| ad.duration)
            .sum::<u64>()
            .saturating_sub(start_offset)
    }

    /// First ad at or after `from` that can still be placed.
    pub(crate) fn next_valid_ad(&self, from: usize) -> Option<usize> {
        (from..self.ads.len()).find(|&idx| !self.ads[idx].invalid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdOnPeriod {
    pub ad_idx: usize,
    /// Offset inside the ad at which this period starts playing it.
    pub ad_start_offset: u64,
}

/// Placement index of one source period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeriodAdData {
    /// Duration of the period observed so far.
    pub duration: u64,
    /// The cursor has moved on from this period.
    pub filled: bool,
    pub break_id: Option<String>,
    /// Offset in the period to the ad playing from there on. A step function
    /// looked up with the greatest key not above the position.
    pub offset_to_ad: BTreeMap<u64, AdOnPeriod>,
}

impl PeriodAdData {
    pub(crate) fn for_break(break_id: impl Into<String>, first: AdOnPeriod) -> Self {
        Self {
            break_id: Some(break_id.into()),
            offset_to_ad: BTreeMap::from([(0, first)]),
            ..Default::default()
        }
    }
}

/// An ad manifest resolution waiting in the fulfillment queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdFulfillObj {
    pub period_id: String,
    pub ad_id: String,
    pub url: String,
}
