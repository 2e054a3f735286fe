//! Incremental mapping of resolved ads onto the source timeline.
//!
//! Each manifest refresh hands the parsed period list to
//! [`CdaiState::place_ads`], which consumes the newly advertised source
//! content against the ads of the break being placed. The cursor survives
//! between refreshes, so a break can be placed across many refreshes and
//! across several periods when the ads run past the signaling period.

use crate::{
    config::CdaiConfig,
    manifest::SourceManifest,
    model::{AdBreak, AdOnPeriod, PeriodAdData, TimelinePoint},
    state::CdaiState,
};

/// Progress of the break being placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementCursor {
    pub break_id: String,
    /// Source period receiving ad time.
    pub open_period_id: String,
    /// Last fragment number of the open period already accounted for.
    pub cur_end_number: u64,
    pub ad_idx: usize,
    /// Time of the current ad already mapped onto the source.
    pub ad_next_offset: u64,
    /// Time of the current ad mapped before the open period started.
    pub ad_start_offset: u64,
    /// The current ad ended exactly at the end of the known period content.
    pub wait_for_next_period: bool,
    /// Source content observed while the current ad was still unresolved.
    pub carry_ms: u64,
}

impl PlacementCursor {
    fn new(break_id: &str, ad_idx: usize) -> Self {
        Self {
            break_id: break_id.to_string(),
            open_period_id: break_id.to_string(),
            cur_end_number: 0,
            ad_idx,
            ad_next_offset: 0,
            ad_start_offset: 0,
            wait_for_next_period: false,
            carry_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Placement {
    #[default]
    Idle,
    /// Mapping ads onto the source timeline.
    Placing(PlacementCursor),
    /// Every ad is placed. The end marker may still snap to the next period.
    Aligning { break_id: String },
}

impl Placement {
    pub fn break_id(&self) -> Option<&str> {
        match self {
            Placement::Idle => None,
            Placement::Placing(cursor) => Some(&cursor.break_id),
            Placement::Aligning { break_id } => Some(break_id),
        }
    }
}

enum Step {
    /// Nothing more can happen before the next refresh.
    Wait(Placement),
    Continue(Placement),
}

enum Consumed {
    Wait,
    BreakDone { end_offset: u64 },
}

impl CdaiState {
    /// Advances placement with the latest manifest.
    ///
    /// Repeated calls with an unchanged manifest leave the state untouched.
    pub fn place_ads(&mut self, manifest: &SourceManifest) {
        loop {
            let step = match std::mem::take(&mut self.placement) {
                Placement::Idle => self.activate_next_break(),
                Placement::Placing(cursor) => self.place_in_open_period(cursor, manifest),
                Placement::Aligning { break_id } => self.align_break_end(break_id, manifest),
            };

            match step {
                Step::Wait(placement) => {
                    self.placement = placement;
                    break;
                }
                Step::Continue(placement) => self.placement = placement,
            }
        }
    }

    fn activate_next_break(&mut self) -> Step {
        let Some(break_id) = self.pending_breaks.first().cloned() else {
            return Step::Wait(Placement::Idle);
        };
        self.activate(&break_id)
    }

    /// Places `break_id` from its beginning, leaving the current break queued.
    pub(crate) fn restart_placement(&mut self, break_id: &str) {
        self.placement = match self.activate(break_id) {
            Step::Wait(placement) | Step::Continue(placement) => placement,
        };
    }

    /// Starts placing `break_id` from the beginning of its signaling period.
    fn activate(&mut self, break_id: &str) -> Step {
        let Some(brk) = self.breaks.get_mut(break_id) else {
            self.pending_breaks.retain(|id| id != break_id);
            return Step::Continue(Placement::Idle);
        };

        if brk.placed {
            self.pending_breaks.retain(|id| id != break_id);
            return Step::Continue(Placement::Idle);
        }

        let Some(first) = skip_invalid_ads(brk, 0) else {
            tracing::warn!(break_id, "No valid ad left in break");
            brk.placed = true;
            brk.end = Some(TimelinePoint::new(break_id, 0));
            return Step::Continue(Placement::Aligning {
                break_id: break_id.to_string(),
            });
        };

        // Content mapped by an interrupted attempt is counted again from scratch.
        self.periods.retain(|period_id, period| {
            period_id == break_id || period.break_id.as_deref() != Some(break_id)
        });
        let period = self.periods.entry(break_id.to_string()).or_default();
        *period = PeriodAdData::for_break(
            break_id,
            AdOnPeriod {
                ad_idx: first,
                ad_start_offset: 0,
            },
        );

        tracing::info!(break_id, ad_idx = first, "Placing ad break");
        Step::Continue(Placement::Placing(PlacementCursor::new(break_id, first)))
    }

    fn place_in_open_period(
        &mut self,
        mut cursor: PlacementCursor,
        manifest: &SourceManifest,
    ) -> Step {
        let config = self.config.clone();
        let align = config.align_factor_ms;
        let tiny = config.tiny_period_ms;

        if !self.breaks.contains_key(&cursor.break_id) {
            tracing::warn!(break_id = %cursor.break_id, "Ad break vanished while placing");
            self.pending_breaks.retain(|id| *id != cursor.break_id);
            return Step::Continue(Placement::Idle);
        }
        let Some(period_idx) = manifest.position(&cursor.open_period_id) else {
            tracing::debug!(period_id = %cursor.open_period_id, "Open period not in manifest yet");
            return Step::Wait(Placement::Placing(cursor));
        };

        let period_duration = manifest.period_duration_ms(period_idx);
        let next_period_id = manifest
            .next_non_empty_period(period_idx)
            .map(|(_, period)| period.id.clone());

        let Some(brk) = self.breaks.get_mut(&cursor.break_id) else {
            return Step::Continue(Placement::Idle);
        };
        let period = self.periods.entry(cursor.open_period_id.clone()).or_default();
        if period.break_id.is_none() {
            period.break_id = Some(cursor.break_id.clone());
            period.offset_to_ad.insert(
                0,
                AdOnPeriod {
                    ad_idx: cursor.ad_idx,
                    ad_start_offset: cursor.ad_next_offset,
                },
            );
        }

        let mut fresh = manifest.new_content_duration_ms(period_idx, &mut cursor.cur_end_number);
        period.duration += fresh;
        // Fragment durations may be corrected between refreshes.
        if period_duration > period.duration {
            let diff = period_duration - period.duration;
            fresh += diff;
            period.duration += diff;
        }
        let mut delta = fresh + std::mem::take(&mut cursor.carry_ms);
        if delta > 0 {
            tracing::trace!(
                period_id = %cursor.open_period_id,
                delta,
                accumulated = period.duration,
                "New source content"
            );
        }

        let consumed = loop {
            let Some(ad) = brk.ads.get(cursor.ad_idx) else {
                break Consumed::BreakDone {
                    end_offset: period.duration.saturating_sub(delta),
                };
            };

            if ad.invalid {
                brk.ads[cursor.ad_idx].placed = true;
                match skip_invalid_ads(brk, cursor.ad_idx + 1) {
                    Some(next) => {
                        start_next_ad(brk, period, &mut cursor, next, delta, &config);
                        continue;
                    }
                    None => {
                        break Consumed::BreakDone {
                            end_offset: period.duration.saturating_sub(delta),
                        }
                    }
                }
            }
            if !ad.resolved {
                cursor.carry_ms = delta;
                break Consumed::Wait;
            }

            let remaining = ad.duration.saturating_sub(cursor.ad_next_offset);
            if remaining > 0 {
                if delta < remaining {
                    cursor.ad_next_offset += delta;
                    break Consumed::Wait;
                }
                cursor.ad_next_offset += remaining;
                delta -= remaining;
            }

            // The current ad is fully mapped.
            match skip_invalid_ads(brk, cursor.ad_idx + 1) {
                Some(next) if delta > 0 => {
                    brk.ads[cursor.ad_idx].placed = true;
                    start_next_ad(brk, period, &mut cursor, next, delta, &config);
                }
                Some(_) => {
                    cursor.wait_for_next_period = true;
                    break Consumed::Wait;
                }
                None => {
                    brk.ads[cursor.ad_idx].placed = true;
                    break Consumed::BreakDone {
                        end_offset: period.duration.saturating_sub(delta),
                    };
                }
            }
        };

        if let Consumed::BreakDone { end_offset } = consumed {
            return Step::Continue(self.finish_placing(&cursor, end_offset));
        }

        // A period followed by content is closed. Whatever the current ad
        // still needs has to go into the next period or be dropped.
        let Some(next_period_id) = next_period_id else {
            return Step::Wait(Placement::Placing(cursor));
        };
        if cursor.carry_ms > 0 || brk.ads.get(cursor.ad_idx).is_some_and(|ad| !ad.resolved) {
            return Step::Wait(Placement::Placing(cursor));
        }

        if cursor.wait_for_next_period {
            brk.ads[cursor.ad_idx].placed = true;
            let Some(next) = skip_invalid_ads(brk, cursor.ad_idx + 1) else {
                let end_offset = period.duration;
                return Step::Continue(self.finish_placing(&cursor, end_offset));
            };
            cursor.ad_idx = next;
            cursor.ad_next_offset = 0;
            cursor.wait_for_next_period = false;
            let ad = &mut brk.ads[next];
            if ad.base.is_none() {
                ad.base = Some(TimelinePoint::new(next_period_id.as_str(), 0));
            }
            brk.split_period = true;
            self.open_next_period(&mut cursor, &next_period_id, 0);
            return Step::Continue(Placement::Placing(cursor));
        }

        let remaining_in_break = brk.remaining_duration(cursor.ad_idx, cursor.ad_start_offset);
        let base_offset = brk.ads[cursor.ad_idx]
            .base
            .as_ref()
            .filter(|base| base.period_id == cursor.open_period_id)
            .map(|base| base.offset_ms)
            .unwrap_or_default();
        let available = period_duration.saturating_sub(base_offset);

        // A break that already spans periods keeps carrying its ad forward,
        // even through a tiny period.
        let split = brk.split_period
            || (period_duration > tiny && available + align < remaining_in_break);
        if split {
            brk.split_period = true;
            let ad_next_offset = cursor.ad_next_offset;
            tracing::info!(
                break_id = %cursor.break_id,
                from = %cursor.open_period_id,
                to = %next_period_id,
                ad_next_offset,
                "Ad break spans into the next period"
            );
            self.open_next_period(&mut cursor, &next_period_id, ad_next_offset);
            return Step::Continue(Placement::Placing(cursor));
        }

        // The rest of the break fits in the alignment slack: clamp it here.
        // Only a break that never left its signaling period gets here.
        for ad in brk.ads.iter_mut().skip(cursor.ad_idx) {
            ad.placed = true;
        }
        if period.duration <= tiny {
            tracing::warn!(
                period_id = %cursor.open_period_id,
                duration = period.duration,
                "Ad break landed on a tiny period, invalidating its ads"
            );
            for ad in brk.ads.iter_mut() {
                ad.placed = true;
                ad.invalid = true;
            }
        }
        let end_offset = period.duration;
        Step::Continue(self.finish_placing(&cursor, end_offset))
    }

    /// Moves the cursor to `next_period_id`, which from now on plays ads of
    /// the break being placed.
    fn open_next_period(
        &mut self,
        cursor: &mut PlacementCursor,
        next_period_id: &str,
        ad_start_offset: u64,
    ) {
        if next_period_id != cursor.break_id {
            let absorbed = self
                .breaks
                .get(next_period_id)
                .is_some_and(|brk| brk.ads_duration > 0);
            if absorbed {
                tracing::warn!(
                    break_id = %cursor.break_id,
                    absorbed = next_period_id,
                    "Dropping ad break overlapped by a split ad break"
                );
                self.breaks.remove(next_period_id);
                self.pending_breaks.retain(|id| id != next_period_id);
            }
        }

        if let Some(period) = self.periods.get_mut(&cursor.open_period_id) {
            period.filled = true;
        }
        self.periods.insert(
            next_period_id.to_string(),
            PeriodAdData::for_break(
                cursor.break_id.as_str(),
                AdOnPeriod {
                    ad_idx: cursor.ad_idx,
                    ad_start_offset,
                },
            ),
        );

        cursor.open_period_id = next_period_id.to_string();
        cursor.cur_end_number = 0;
        cursor.ad_start_offset = ad_start_offset;
    }

    fn finish_placing(&mut self, cursor: &PlacementCursor, end_offset: u64) -> Placement {
        if let Some(brk) = self.breaks.get_mut(&cursor.break_id) {
            brk.placed = true;
            brk.end = Some(TimelinePoint::new(cursor.open_period_id.as_str(), end_offset));
        }
        tracing::info!(
            break_id = %cursor.break_id,
            end_period_id = %cursor.open_period_id,
            end_offset,
            "All ads of the break are placed"
        );

        Placement::Aligning {
            break_id: cursor.break_id.clone(),
        }
    }

    /// Snaps the end of a placed break onto a period boundary when it falls
    /// within the alignment slack of one.
    fn align_break_end(&mut self, break_id: String, manifest: &SourceManifest) -> Step {
        let align = self.config.align_factor_ms;
        let Some(end) = self
            .breaks
            .get(&break_id)
            .and_then(|brk| brk.end.clone())
        else {
            return self.complete_break(&break_id, None);
        };

        let Some(period_idx) = manifest.position(&end.period_id) else {
            return self.complete_break(&break_id, Some(end));
        };

        let end = if end.offset_ms < 2 * align {
            self.periods
                .insert(end.period_id.clone(), PeriodAdData::default());
            TimelinePoint::new(end.period_id, 0)
        } else if manifest
            .period_duration_ms(period_idx)
            .saturating_sub(end.offset_ms)
            < align
        {
            match manifest.next_non_empty_period(period_idx) {
                Some((_, next)) => TimelinePoint::new(next.id.as_str(), 0),
                None => return Step::Wait(Placement::Aligning { break_id }),
            }
        } else {
            end
        };

        if let Some(brk) = self.breaks.get_mut(&break_id) {
            brk.end = Some(end.clone());
        }
        self.complete_break(&break_id, Some(end))
    }

    /// Drops `break_id` from the queue and picks the next break to place.
    fn complete_break(&mut self, break_id: &str, end: Option<TimelinePoint>) -> Step {
        if let Some(brk) = self.breaks.get(break_id) {
            let placed = brk.ads.iter().filter(|ad| ad.placed && !ad.invalid).count();
            tracing::info!(
                break_id,
                end = ?end,
                split = brk.split_period,
                ads = brk.ads.len(),
                placed,
                "Ad break placement finished"
            );
        }

        let position = self.pending_breaks.iter().position(|id| id == break_id);
        self.pending_breaks.retain(|id| id != break_id);

        let end_period_id = end.as_ref().map(|end| end.period_id.as_str());
        let next = end_period_id
            .filter(|id| *id != break_id)
            .and_then(|id| self.pending_breaks.iter().find(|pending| *pending == id))
            .or_else(|| self.pending_breaks.get(position.unwrap_or(0)))
            .or_else(|| self.pending_breaks.first())
            .cloned();

        match next {
            Some(next) => self.activate(&next),
            None => Step::Wait(Placement::Idle),
        }
    }
}

/// Index of the first ad from `from` on that is not invalid. The invalid
/// ads skipped on the way count as placed.
fn skip_invalid_ads(brk: &mut AdBreak, from: usize) -> Option<usize> {
    let next = brk.next_valid_ad(from);
    let skipped_until = next.unwrap_or(brk.ads.len());
    for ad in brk.ads.iter_mut().take(skipped_until).skip(from) {
        ad.placed = true;
    }
    next
}

/// Starts the ad `next` at the position where `delta` of the open period is
/// still unconsumed.
fn start_next_ad(
    brk: &mut AdBreak,
    period: &mut PeriodAdData,
    cursor: &mut PlacementCursor,
    next: usize,
    delta: u64,
    config: &CdaiConfig,
) {
    cursor.ad_idx = next;
    cursor.ad_next_offset = 0;
    cursor.ad_start_offset = 0;
    cursor.wait_for_next_period = false;

    let offset = period.duration.saturating_sub(delta);
    let ad = &mut brk.ads[next];
    if ad.base.is_none() {
        ad.base = Some(TimelinePoint::new(cursor.open_period_id.as_str(), offset));
    }
    period.offset_to_ad.insert(
        config.align_floor(offset),
        AdOnPeriod {
            ad_idx: next,
            ad_start_offset: 0,
        },
    );
}
