use crate::state::CdaiState;

/// What playback finds at a position of a source period.
#[derive(Debug, Clone, PartialEq)]
pub enum AdMatch {
    /// Inside a break, with no playable ad at the position.
    Break { break_id: String },
    Ad {
        break_id: String,
        ad_idx: usize,
        /// Seconds into the ad.
        ad_offset: f64,
    },
}

impl AdMatch {
    pub fn break_id(&self) -> &str {
        match self {
            AdMatch::Break { break_id } | AdMatch::Ad { break_id, .. } => break_id,
        }
    }
}

impl CdaiState {
    /// Looks up the ad covering `offset` seconds into `period_id`.
    ///
    /// Seamless playback (normal rate, not the initial tune) only matches an
    /// ad starting at the aligned position. Otherwise the ad active at the
    /// position is searched for.
    pub fn check_for_ad_start(
        &mut self,
        rate: f32,
        init: bool,
        period_id: &str,
        offset: f64,
    ) -> Option<AdMatch> {
        let period = self.periods.get(period_id)?;
        let break_id = period.break_id.clone()?;
        let Some(brk) = self.breaks.get(&break_id) else {
            tracing::debug!(period_id, %break_id, "Ad break not found for period");
            return None;
        };
        if brk.invalid {
            return None;
        }

        let key = (offset.max(0.0) * 1000.0) as u64;
        let end = brk.end.as_ref().filter(|end| end.period_id == period_id);
        let mut found = None;

        if !init && rate == 1.0 {
            let floor = self.config.align_floor(key);
            let entry = period
                .offset_to_ad
                .get(&floor)
                .or_else(|| period.offset_to_ad.get(&(floor + self.config.align_factor_ms)));
            if let Some(entry) = entry.filter(|entry| entry.ad_start_offset == 0) {
                found = Some((entry.ad_idx, 0));
            }
        } else {
            let limit = end.map_or(period.duration, |end| end.offset_ms);
            if key < limit || (rate < 0.0 && key == limit) {
                if let Some((start, entry)) = period.offset_to_ad.range(..=key).next_back() {
                    found = Some((entry.ad_idx, key - start + entry.ad_start_offset));
                }
            }
        }

        let found = found.filter(|(ad_idx, _)| {
            brk.ads.get(*ad_idx).is_some_and(|ad| !ad.invalid)
        });
        let Some((ad_idx, ad_offset_ms)) = found else {
            if rate >= 1.0 && end.is_some_and(|end| key >= end.offset_ms) {
                return None;
            }
            return Some(AdMatch::Break { break_id });
        };

        let switch = self.placement.break_id() != Some(break_id.as_str())
            && !brk.ads[ad_idx].placed
            && self.pending_breaks.contains(&break_id);
        if switch {
            tracing::info!(
                from = ?self.placement.break_id(),
                to = %break_id,
                "Switching placement to the ad break being played"
            );
            self.restart_placement(&break_id);
        }

        Some(AdMatch::Ad {
            break_id,
            ad_idx,
            ad_offset: ad_offset_ms as f64 / 1000.0,
        })
    }

    /// Whether the ad being played is over at `offset` seconds into it.
    pub fn check_for_ad_terminate(&self, offset: f64) -> bool {
        if offset <= 0.0 {
            return false;
        }
        let Some(ad) = self.current_ad() else {
            return false;
        };
        offset * 1000.0 >= (ad.duration + self.config.align_factor_ms) as f64
    }
}
