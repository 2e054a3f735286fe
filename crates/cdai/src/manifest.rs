//! Period and segment timeline view of a DASH manifest, reduced to what ad
//! placement needs: how long each period is and how much content was added
//! since the previous refresh.

use std::time::Duration;

use dash_mpd::{AdaptationSet, Period, SegmentTemplate, MPD};

use crate::error::{CdaiError, CdaiResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    /// Fragment duration in timescale units.
    pub duration: u64,
    /// Number of additional fragments with the same duration.
    pub repeat: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTimeline {
    pub timescale: u64,
    pub start_number: u64,
    pub entries: Vec<TimelineEntry>,
}

impl SegmentTimeline {
    pub fn new(timescale: u64, start_number: u64, entries: Vec<TimelineEntry>) -> Self {
        Self {
            timescale: timescale.max(1),
            start_number,
            entries,
        }
    }

    /// Fragments as `(number, duration_ms)`, in order.
    fn fragments(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        let timescale = self.timescale as f64;
        self.entries
            .iter()
            .flat_map(move |entry| {
                let duration_ms = (entry.duration * 1000) as f64 / timescale;
                std::iter::repeat(duration_ms).take(entry.repeat as usize + 1)
            })
            .enumerate()
            .map(move |(i, duration_ms)| (self.start_number + i as u64, duration_ms))
    }

    pub fn duration_ms(&self) -> u64 {
        self.fragments().map(|(_, d)| d).sum::<f64>().round() as u64
    }

    pub fn last_number(&self) -> Option<u64> {
        self.fragments().last().map(|(n, _)| n)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePeriod {
    pub id: String,
    /// `Period@duration`, when the manifest declares one.
    pub declared_duration_ms: Option<u64>,
    pub timeline: Option<SegmentTimeline>,
}

impl SourcePeriod {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            declared_duration_ms: None,
            timeline: None,
        }
    }

    pub fn with_timeline(mut self, timeline: SegmentTimeline) -> Self {
        self.timeline = Some(timeline);
        self
    }

    pub fn with_declared_duration(mut self, duration_ms: u64) -> Self {
        self.declared_duration_ms = Some(duration_ms);
        self
    }

    pub fn duration_ms(&self) -> u64 {
        match self.declared_duration_ms {
            Some(duration) if duration > 0 => duration,
            _ => self
                .timeline
                .as_ref()
                .map(SegmentTimeline::duration_ms)
                .unwrap_or_default(),
        }
    }
}

/// The ordered periods of one manifest refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceManifest {
    pub periods: Vec<SourcePeriod>,
}

impl SourceManifest {
    pub fn new(periods: Vec<SourcePeriod>) -> Self {
        Self { periods }
    }

    pub fn parse(text: &str) -> CdaiResult<Self> {
        let mpd = dash_mpd::parse(text)?;
        Ok(Self::from_mpd(&mpd))
    }

    pub fn from_mpd(mpd: &MPD) -> Self {
        let is_static = mpd.mpdtype.as_deref().unwrap_or("static") == "static";
        let single_period = mpd.periods.len() == 1;

        let periods = mpd
            .periods
            .iter()
            .enumerate()
            .map(|(index, period)| {
                let mut declared_duration_ms = period.duration.map(|d| d.as_millis() as u64);
                // A lone VOD period may only carry the presentation duration.
                if declared_duration_ms.is_none() && is_static && single_period {
                    declared_duration_ms =
                        mpd.mediaPresentationDuration.map(|d| d.as_millis() as u64);
                }

                SourcePeriod {
                    id: period.id.clone().unwrap_or_else(|| index.to_string()),
                    declared_duration_ms,
                    timeline: period_timeline(period),
                }
            })
            .collect();

        Self { periods }
    }

    pub fn position(&self, period_id: &str) -> Option<usize> {
        self.periods.iter().position(|p| p.id == period_id)
    }

    pub fn period_duration_ms(&self, idx: usize) -> u64 {
        self.periods
            .get(idx)
            .map(SourcePeriod::duration_ms)
            .unwrap_or_default()
    }

    /// Duration of the fragments numbered after `cur_end_number`, which is
    /// advanced to the last fragment seen.
    pub fn new_content_duration_ms(&self, idx: usize, cur_end_number: &mut u64) -> u64 {
        let Some(timeline) = self.periods.get(idx).and_then(|p| p.timeline.as_ref()) else {
            return 0;
        };

        let mut duration_ms = 0f64;
        for (number, fragment_ms) in timeline.fragments() {
            if number > *cur_end_number {
                duration_ms += fragment_ms;
                *cur_end_number = number;
            }
        }
        duration_ms.round() as u64
    }

    /// The first period after `idx` that carries content.
    pub fn next_non_empty_period(&self, idx: usize) -> Option<(usize, &SourcePeriod)> {
        self.periods
            .iter()
            .enumerate()
            .skip(idx + 1)
            .find(|(_, period)| period.duration_ms() > 0)
    }

    pub fn period_ids(&self) -> Vec<String> {
        self.periods.iter().map(|p| p.id.clone()).collect()
    }
}

/// Duration of an ad creative, summed over its periods.
pub fn ad_duration_ms(mpd: &MPD) -> u64 {
    SourceManifest::from_mpd(mpd)
        .periods
        .iter()
        .map(|period| match &period.timeline {
            Some(timeline) => timeline.duration_ms(),
            None => period.declared_duration_ms.unwrap_or_default(),
        })
        .sum()
}

/// Parses an ad manifest that must hold exactly one period.
pub fn parse_ad_manifest(text: &str) -> CdaiResult<MPD> {
    let mpd = dash_mpd::parse(text)?;
    match mpd.periods.len() {
        0 => Err(CdaiError::EmptyAd),
        1 => Ok(mpd),
        n => Err(CdaiError::MultiPeriodAd(n)),
    }
}

fn is_video(adaptation: &AdaptationSet) -> bool {
    adaptation.contentType.as_deref() == Some("video")
        || adaptation
            .mimeType
            .as_deref()
            .is_some_and(|mime| mime.starts_with("video"))
}

fn period_timeline(period: &Period) -> Option<SegmentTimeline> {
    let adaptation = period
        .adaptations
        .iter()
        .find(|adaptation| is_video(adaptation))
        .or_else(|| period.adaptations.first())?;

    let representation_template = adaptation
        .representations
        .first()
        .and_then(|r| r.SegmentTemplate.as_ref());
    let template = representation_template
        .filter(|t| t.SegmentTimeline.is_some())
        .or(adaptation.SegmentTemplate.as_ref())
        .or(representation_template)?;

    to_timeline(template, adaptation.SegmentTemplate.as_ref(), period.duration)
}

fn to_timeline(
    template: &SegmentTemplate,
    outer: Option<&SegmentTemplate>,
    period_duration: Option<Duration>,
) -> Option<SegmentTimeline> {
    let timeline = template.SegmentTimeline.as_ref()?;
    let timescale = template
        .timescale
        .or(outer.and_then(|t| t.timescale))
        .unwrap_or(1);
    let start_number = template
        .startNumber
        .or(outer.and_then(|t| t.startNumber))
        .unwrap_or(1);
    let presentation_time_offset = template
        .presentationTimeOffset
        .or(outer.and_then(|t| t.presentationTimeOffset))
        .unwrap_or(0);
    let period_end = period_duration.map(|d| {
        presentation_time_offset + (d.as_millis() as u64).saturating_mul(timescale) / 1000
    });

    let mut entries = Vec::with_capacity(timeline.segments.len());
    let mut time = 0;
    for (i, s) in timeline.segments.iter().enumerate() {
        if let Some(t) = s.t {
            time = t;
        }
        let repeat = match s.r {
            // Repeats until the next S@t, or the end of the period.
            Some(r) if r < 0 => {
                let end = timeline
                    .segments
                    .get(i + 1)
                    .and_then(|next| next.t)
                    .or(period_end);
                match end {
                    Some(end) if s.d > 0 && end > time => (end - time).div_ceil(s.d) - 1,
                    _ => {
                        tracing::warn!(time, d = s.d, "Cannot resolve open-ended S@r, counting one fragment");
                        0
                    }
                }
            }
            r => r.unwrap_or(0).max(0) as u64,
        };
        time += s.d * (repeat + 1);
        entries.push(TimelineEntry {
            duration: s.d,
            repeat,
        });
    }

    Some(SegmentTimeline::new(timescale, start_number, entries))
}
