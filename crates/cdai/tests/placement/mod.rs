use std::sync::Arc;

use cdai::{
    AdMatch, CdaiConfig, CdaiState, Placement, ResolvedAd, SourceManifest, TimelinePoint,
};

use crate::AssertWrapper;

fn snapshot(p0_repeat: u32, p1: bool) -> String {
    let next = if p1 {
        r#"
  <Period id="p1" start="PT12S">
    <AdaptationSet id="1" contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" startNumber="7" media="v_$Number$.m4s" initialization="v_init.mp4">
        <SegmentTimeline>
          <S t="12000" d="2000"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v0" bandwidth="800000" width="640" height="360"/>
    </AdaptationSet>
  </Period>"#
    } else {
        ""
    };

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" minimumUpdatePeriod="PT2S">
  <Period id="p0" start="PT0S">
    <AdaptationSet id="1" contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" startNumber="1" media="v_$Number$.m4s" initialization="v_init.mp4">
        <SegmentTimeline>
          <S t="0" d="2000" r="{p0_repeat}"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v0" bandwidth="800000" width="640" height="360"/>
    </AdaptationSet>
    <AdaptationSet id="2" contentType="audio" mimeType="audio/mp4">
      <SegmentTemplate timescale="48000" startNumber="1" media="a_$Number$.m4s" initialization="a_init.mp4">
        <SegmentTimeline>
          <S t="0" d="96000" r="{p0_repeat}"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="a0" bandwidth="128000"/>
    </AdaptationSet>
  </Period>{next}
</MPD>"#
    )
}

#[test]
fn test_place_from_manifest_refreshes() {
    let mut state = CdaiState::new(Arc::new(CdaiConfig::default()));
    state.set_alternate_contents("p0", "", "", 10000).assert_success();
    let obj = state
        .set_alternate_contents("p0", "ad1", "http://ads.example.com/ad1.mpd", 10000)
        .assert_success()
        .assert_success();
    state.apply_resolution(
        &obj,
        Ok(ResolvedAd {
            mpd: None,
            duration_ms: 10000,
            url: obj.url.clone(),
        }),
    );

    let first = SourceManifest::parse(&snapshot(2, false)).assert_success();
    state.place_ads(&first);
    let Placement::Placing(cursor) = state.placement() else {
        panic!("expected the break to be placing");
    };
    assert_eq!(cursor.ad_next_offset, 6000);
    assert_eq!(cursor.cur_end_number, 3);

    let second = SourceManifest::parse(&snapshot(5, true)).assert_success();
    state.place_ads(&second);

    let brk = state.ad_break("p0").assert_success();
    assert!(brk.placed);
    assert!(!brk.split_period);
    assert_eq!(brk.end, Some(TimelinePoint::new("p0", 10000)));
    assert_eq!(state.placement(), &Placement::Idle);

    assert_eq!(
        state.check_for_ad_start(1.0, false, "p0", 0.0),
        Some(AdMatch::Ad {
            break_id: "p0".into(),
            ad_idx: 0,
            ad_offset: 0.0,
        })
    );
    assert_eq!(state.check_for_ad_start(1.0, true, "p0", 11.0), None);
    assert!(state.is_period_in_ad_break("p0"));
    assert!(!state.is_period_in_ad_break("p1"));

    state.prune_period_maps(&second.period_ids()[1..]);
    assert!(state.ad_break("p0").is_none());
}
