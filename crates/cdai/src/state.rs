use std::{collections::HashMap, sync::Arc};

use dash_mpd::MPD;

use crate::{
    config::CdaiConfig,
    error::{CdaiError, CdaiResult},
    event::AdResolvedEvent,
    model::{AdBreak, AdFulfillObj, AdNode, AdOnPeriod, PeriodAdData, TimelinePoint},
    placement::Placement,
};

/// A fetched and validated ad manifest.
#[derive(Debug, Clone)]
pub struct ResolvedAd {
    /// `None` when the final manifest will only be served later.
    pub mpd: Option<Arc<MPD>>,
    pub duration_ms: u64,
    /// The URL playback should use for the ad.
    pub url: String,
}

/// All ad breaks, per-period placement data and the placement cursor of one
/// stream.
#[derive(Debug)]
pub struct CdaiState {
    pub(crate) config: Arc<CdaiConfig>,
    pub(crate) breaks: HashMap<String, AdBreak>,
    pub(crate) periods: HashMap<String, PeriodAdData>,
    pub(crate) placement: Placement,
    /// Breaks with resolved ads waiting for placement, in resolution order.
    pub(crate) pending_breaks: Vec<String>,
    pub(crate) current_ad: Option<(String, usize)>,
    pub(crate) current_playing_break: Option<String>,
}

impl CdaiState {
    pub fn new(config: Arc<CdaiConfig>) -> Self {
        Self {
            config,
            breaks: HashMap::new(),
            periods: HashMap::new(),
            placement: Placement::Idle,
            pending_breaks: Vec::new(),
            current_ad: None,
            current_playing_break: None,
        }
    }

    pub fn config(&self) -> &CdaiConfig {
        &self.config
    }

    pub fn ad_break(&self, break_id: &str) -> Option<&AdBreak> {
        self.breaks.get(break_id)
    }

    pub fn ad_breaks(&self) -> &HashMap<String, AdBreak> {
        &self.breaks
    }

    pub fn period(&self, period_id: &str) -> Option<&PeriodAdData> {
        self.periods.get(period_id)
    }

    pub fn periods(&self) -> &HashMap<String, PeriodAdData> {
        &self.periods
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn pending_breaks(&self) -> &[String] {
        &self.pending_breaks
    }

    /// Registers an ad announced for the break signaled at `period_id`.
    ///
    /// An empty `ad_id` or `url` only makes sure the break exists. Otherwise
    /// the ad is appended unresolved and the returned request has to be
    /// fulfilled.
    pub fn set_alternate_contents(
        &mut self,
        period_id: &str,
        ad_id: &str,
        url: &str,
        break_duration_ms: u64,
    ) -> CdaiResult<Option<AdFulfillObj>> {
        if ad_id.is_empty() || url.is_empty() {
            if !self.breaks.contains_key(period_id) {
                tracing::info!(period_id, break_duration_ms, "New ad break");
                self.breaks
                    .insert(period_id.to_string(), AdBreak::new(break_duration_ms));
                self.periods.entry(period_id.to_string()).or_default().break_id =
                    Some(period_id.to_string());
            }
            return Ok(None);
        }

        let brk = self
            .breaks
            .get_mut(period_id)
            .ok_or_else(|| CdaiError::UnknownBreak(period_id.to_string()))?;
        if brk.invalid {
            return Err(CdaiError::BreakTimedOut(period_id.to_string()));
        }
        if brk.break_duration <= brk.ads_duration {
            return Err(CdaiError::BreakFull {
                break_id: period_id.to_string(),
                ads_duration: brk.ads_duration,
                break_duration: brk.break_duration,
            });
        }

        brk.ads.push(AdNode::announced(ad_id, url));
        tracing::debug!(period_id, ad_id, url, "Ad queued for fulfillment");

        Ok(Some(AdFulfillObj {
            period_id: period_id.to_string(),
            ad_id: ad_id.to_string(),
            url: url.to_string(),
        }))
    }

    /// Records the outcome of a fulfillment and builds the event reporting it.
    pub fn apply_resolution(
        &mut self,
        obj: &AdFulfillObj,
        outcome: CdaiResult<ResolvedAd>,
    ) -> AdResolvedEvent {
        let outcome = outcome.and_then(|resolved| self.accept_resolved_ad(obj, resolved));

        match outcome {
            Ok((start_ms, duration_ms)) => {
                tracing::info!(
                    period_id = %obj.period_id,
                    ad_id = %obj.ad_id,
                    start_ms,
                    duration_ms,
                    "Ad resolved"
                );
                AdResolvedEvent::resolved(&obj.ad_id, start_ms, duration_ms)
            }
            Err(e) => {
                tracing::error!(
                    period_id = %obj.period_id,
                    ad_id = %obj.ad_id,
                    url = %obj.url,
                    "Failed to resolve ad: {e}"
                );
                if let Some(ad) = self
                    .breaks
                    .get_mut(&obj.period_id)
                    .and_then(|brk| brk.ads.iter_mut().find(|ad| ad.ad_id == obj.ad_id))
                {
                    ad.resolved = true;
                    ad.invalid = true;
                }
                AdResolvedEvent::failed(&obj.ad_id, e.kind())
            }
        }
    }

    fn accept_resolved_ad(
        &mut self,
        obj: &AdFulfillObj,
        resolved: ResolvedAd,
    ) -> CdaiResult<(u64, u64)> {
        let period_id = obj.period_id.as_str();
        let brk = self
            .breaks
            .get_mut(period_id)
            .ok_or_else(|| CdaiError::UnknownBreak(period_id.to_string()))?;

        let idx = match brk.ad_index(&obj.ad_id) {
            Some(idx) => idx,
            None => {
                tracing::warn!(period_id, ad_id = %obj.ad_id, "Resolved ad was never announced");
                brk.ads.push(AdNode::announced(obj.ad_id.as_str(), obj.url.as_str()));
                brk.ads.len() - 1
            }
        };
        if brk.invalid || brk.ads[idx].invalid {
            return Err(CdaiError::AdInvalidated(obj.ad_id.clone()));
        }

        let start_ms = brk.ads_duration;
        let available = brk.break_duration.saturating_sub(start_ms);
        let duration_ms = if resolved.duration_ms > available {
            tracing::info!(
                available,
                duration = resolved.duration_ms,
                "Ad longer than the space left in its break, trimming"
            );
            available
        } else {
            resolved.duration_ms
        };
        brk.ads_duration += duration_ms;
        brk.resolved = true;

        let ad = &mut brk.ads[idx];
        ad.mpd = resolved.mpd;
        ad.duration = duration_ms;
        ad.url = resolved.url;
        ad.resolved = true;
        // Later ads get their base when they are placed.
        if idx == 0 && ad.base.is_none() {
            ad.base = Some(TimelinePoint::new(period_id, 0));
        }

        if let Some(period) = self.periods.get_mut(period_id) {
            if period.offset_to_ad.is_empty() {
                period.offset_to_ad.insert(
                    0,
                    AdOnPeriod {
                        ad_idx: 0,
                        ad_start_offset: 0,
                    },
                );
            }
        }
        if !self.pending_breaks.iter().any(|id| id == period_id) {
            tracing::info!(break_id = period_id, "Ad break queued for placement");
            self.pending_breaks.push(period_id.to_string());
        }

        Ok((start_ms, duration_ms))
    }

    /// Marks the break signaled at `period_id` as timed out.
    pub fn invalidate_break(&mut self, period_id: &str) {
        if let Some(brk) = self.breaks.get_mut(period_id) {
            tracing::warn!(period_id, "Ad break invalidated by decisioning timeout");
            brk.invalid = true;
        }
    }

    /// Forgets every period missing from `period_ids`, along with its break,
    /// unless the break is being placed or played.
    pub fn prune_period_maps(&mut self, period_ids: &[String]) {
        let placing = self.placement.break_id().map(str::to_string);
        let keep = |id: &String| {
            period_ids.contains(id)
                || placing.as_ref() == Some(id)
                || self.current_playing_break.as_ref() == Some(id)
        };

        let removed: Vec<String> = self.breaks.keys().filter(|id| !keep(id)).cloned().collect();
        for id in removed {
            tracing::info!(period_id = %id, "Removing expired ad break");
            self.breaks.remove(&id);
            self.pending_breaks.retain(|pending| *pending != id);
        }
        self.periods.retain(|id, _| period_ids.contains(id));
    }

    pub fn clear_maps(&mut self) {
        self.breaks.clear();
        self.periods.clear();
        self.pending_breaks.clear();
        self.placement = Placement::Idle;
    }

    /// Clears what playback reported about the ad it is playing.
    pub fn reset_state(&mut self) {
        self.current_ad = None;
        self.current_playing_break = None;
    }

    pub fn insert_to_period_map(&mut self, period_id: &str) {
        self.periods.entry(period_id.to_string()).or_default();
    }

    /// The period was signaled as (part of) an ad break. Whether any ad
    /// fills it depends on the ad schedule.
    pub fn has_dai_ad(&self, period_id: &str) -> bool {
        self.periods
            .get(period_id)
            .is_some_and(|period| period.break_id.is_some())
    }

    pub fn is_period_in_ad_break(&self, period_id: &str) -> bool {
        self.periods
            .get(period_id)
            .is_some_and(|period| period.break_id.is_some())
    }

    pub fn remaining_ad_duration_in_break(
        &self,
        break_id: &str,
        ad_idx: usize,
        start_offset_ms: u64,
    ) -> Option<u64> {
        self.breaks
            .get(break_id)
            .map(|brk| brk.remaining_duration(ad_idx, start_offset_ms))
    }

    /// Playback switched to ad `ad_idx` of `break_id`.
    pub fn set_current_ad(&mut self, break_id: &str, ad_idx: usize) {
        self.current_ad = Some((break_id.to_string(), ad_idx));
        self.current_playing_break = Some(break_id.to_string());
    }

    pub fn current_ad(&self) -> Option<&AdNode> {
        let (break_id, idx) = self.current_ad.as_ref()?;
        self.breaks.get(break_id)?.ads.get(*idx)
    }
}
