use std::time::Duration;

use cdai::{
    AdErrorKind, AdManager, AdMatch, AdResolvedEvent, CdaiConfig, HttpAdFetcher,
    SegmentTimeline, SourceManifest, SourcePeriod, TimelineEntry,
};
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};

use crate::{ad_response, init_test_tracing, setup_mock_server, AssertWrapper};

const WAIT: Duration = Duration::from_secs(5);

fn manager() -> (AdManager<HttpAdFetcher>, UnboundedReceiver<AdResolvedEvent>) {
    init_test_tracing();
    AdManager::new(CdaiConfig::default(), HttpAdFetcher::default())
}

fn live_period(id: &str, fragments: u64) -> SourcePeriod {
    SourcePeriod::new(id).with_timeline(SegmentTimeline::new(
        1000,
        1,
        vec![TimelineEntry {
            duration: 2000,
            repeat: fragments - 1,
        }],
    ))
}

#[tokio::test]
async fn test_resolve_and_place() {
    let (url, _server) = setup_mock_server("/ads/ad1.mpd", ad_response()).await;
    let (manager, mut events) = manager();

    manager.set_alternate_contents("p0", "", "", 30000);
    manager.set_alternate_contents("p0", "ad1", &url, 30000);
    assert!(manager.wait_for_next_ad_resolved(WAIT).await);

    let event = events.recv().await.assert_success();
    assert_eq!(event.ad_id, "ad1");
    assert!(event.success);
    assert_eq!((event.start_ms, event.duration_ms), (0, 10000));
    assert_eq!(event.error, AdErrorKind::None);

    manager.place_ads(&SourceManifest::new(vec![live_period("p0", 6)]));
    {
        let state = manager.state();
        let brk = state.ad_break("p0").assert_success();
        assert!(brk.placed);
        assert_eq!(brk.ads[0].duration, 10000);
        assert!(brk.ads[0].mpd.is_some());
    }

    assert_eq!(
        manager.check_for_ad_start(1.0, true, "p0", 2.0),
        Some(AdMatch::Ad {
            break_id: "p0".into(),
            ad_idx: 0,
            ad_offset: 2.0,
        })
    );
    manager.state().set_current_ad("p0", 0);
    assert!(!manager.check_for_ad_terminate(10.0));
    assert!(manager.check_for_ad_terminate(12.0));
}

#[tokio::test]
async fn test_http_error_invalidates_ad() {
    let (url, _server) = setup_mock_server("/ads/ad1.mpd", ad_response()).await;
    let (manager, mut events) = manager();

    manager.set_alternate_contents("p0", "", "", 30000);
    manager.set_alternate_contents("p0", "ad2", &url.replace("ad1", "ad2"), 30000);
    assert!(manager.wait_for_next_ad_resolved(WAIT).await);

    let event = events.recv().await.assert_success();
    assert!(!event.success);
    assert_eq!((event.start_ms, event.duration_ms), (0, 0));
    assert_eq!(event.error, AdErrorKind::DeliveryHttpError);

    let state = manager.state();
    let ad = &state.ad_break("p0").assert_success().ads[0];
    assert!(ad.resolved);
    assert!(ad.invalid);
}

#[tokio::test]
async fn test_unknown_break_reported_once() {
    let (manager, mut events) = manager();

    manager.set_alternate_contents("p9", "ad1", "http://127.0.0.1:9/ad1.mpd", 30000);

    let event = events.recv().await.assert_success();
    assert_eq!(event.ad_id, "ad1");
    assert!(!event.success);
    assert_eq!(event.error, AdErrorKind::Unknown);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    assert!(manager.state().ad_break("p9").is_none());
    assert!(!manager.wait_for_next_ad_resolved(WAIT).await);
}

#[tokio::test]
async fn test_downloads_disabled() {
    let (url, _server) = setup_mock_server("/ads/ad1.mpd", ad_response()).await;
    let (manager, mut events) = manager();

    manager.set_downloads_enabled(false);
    manager.set_alternate_contents("p0", "", "", 30000);
    manager.set_alternate_contents("p0", "ad1", &url, 30000);

    assert!(manager.wait_for_next_ad_resolved(WAIT).await);
    assert!(!manager.state().ad_break("p0").assert_success().ads[0].resolved);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    manager.set_downloads_enabled(true);
    assert!(manager.wait_for_next_ad_resolved(WAIT).await);
    assert!(manager.state().ad_break("p0").assert_success().ads[0].resolved);
    assert!(events.recv().await.assert_success().success);
}

#[tokio::test]
async fn test_break_wait_timeout_invalidates_break() {
    let (url, _server) = setup_mock_server(
        "/ads/ad1.mpd",
        ad_response().set_delay(Duration::from_millis(500)),
    )
    .await;
    let (manager, mut events) = manager();

    manager.set_alternate_contents("p0", "", "", 30000);
    manager.set_alternate_contents("p0", "ad1", &url, 30000);

    assert!(
        !manager
            .wait_for_ad_break_resolved("p0", Duration::from_millis(50))
            .await
    );
    assert!(manager.state().ad_break("p0").assert_success().invalid);

    // The fetch still completes, but its ad is dropped.
    let event = events.recv().await.assert_success();
    assert!(!event.success);
    assert_eq!(event.error, AdErrorKind::DeliveryTimeout);

    // No ad is accepted for a timed out break.
    manager.set_alternate_contents("p0", "ad2", &url, 30000);
    let event = events.recv().await.assert_success();
    assert_eq!(event.ad_id, "ad2");
    assert_eq!(event.error, AdErrorKind::DecisioningTimeout);
}

#[tokio::test]
async fn test_break_wait_unknown_break() {
    let (manager, _events) = manager();
    assert!(
        !manager
            .wait_for_ad_break_resolved("p0", Duration::from_millis(50))
            .await
    );
}

#[tokio::test]
async fn test_wait_times_out() {
    let (url, _server) = setup_mock_server(
        "/ads/ad1.mpd",
        ad_response().set_delay(Duration::from_millis(500)),
    )
    .await;
    let (manager, _events) = manager();

    manager.set_alternate_contents("p0", "", "", 30000);
    manager.set_alternate_contents("p0", "ad1", &url, 30000);

    assert!(
        !manager
            .wait_for_next_ad_resolved(Duration::from_millis(50))
            .await
    );
    manager.abort_wait_for_next_ad_resolved();
    assert!(manager.wait_for_next_ad_resolved(WAIT).await);
}

#[tokio::test]
async fn test_shutdown_stops_fulfillment() {
    let (url, _server) = setup_mock_server("/ads/ad1.mpd", ad_response()).await;
    let (manager, mut events) = manager();

    manager.shutdown();
    manager.set_alternate_contents("p0", "", "", 30000);
    manager.set_alternate_contents("p0", "ad1", &url, 30000);

    assert!(
        !manager
            .wait_for_next_ad_resolved(Duration::from_millis(200))
            .await
    );
    assert!(!manager.state().ad_break("p0").assert_success().ads[0].resolved);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}
