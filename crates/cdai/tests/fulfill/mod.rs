use cdai::{fulfill::fetch_ad, AdErrorKind, CdaiConfig, HttpAdFetcher};
use reqwest::Url;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

use crate::{ad_response, setup_mock_server, AssertWrapper, AD_MPD, MULTI_PERIOD_AD_MPD};

async fn setup_recording_proxy(response: ResponseTemplate) -> (CdaiConfig, MockServer) {
    let proxy = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/adrec"))
        .and(query_param("clientId", "FOG_AAMP"))
        .respond_with(response)
        .mount(&proxy)
        .await;

    let config = CdaiConfig {
        recording_proxy: Some(Url::parse(&proxy.uri()).unwrap()),
        ..Default::default()
    };
    (config, proxy)
}

#[tokio::test]
async fn test_fetch_ad() {
    let (url, _server) = setup_mock_server("/ads/ad1.mpd", ad_response()).await;

    let resolved = fetch_ad(&HttpAdFetcher::default(), &CdaiConfig::default(), &url)
        .await
        .assert_success();

    assert_eq!(resolved.duration_ms, 10000);
    assert_eq!(resolved.url, url);
    let mpd = resolved.mpd.assert_success();
    assert_eq!(mpd.periods.len(), 1);
}

#[tokio::test]
async fn test_fetch_ad_not_found() {
    let (url, _server) = setup_mock_server("/ads/ad1.mpd", ad_response()).await;
    let missing = url.replace("ad1", "ad2");

    let err = fetch_ad(&HttpAdFetcher::default(), &CdaiConfig::default(), &missing)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), AdErrorKind::DeliveryHttpError);
}

#[tokio::test]
async fn test_fetch_ad_invalid_manifest() {
    let (url, _server) = setup_mock_server(
        "/ads/ad1.mpd",
        ResponseTemplate::new(200).set_body_string("<MPD><Invalid></MPD>"),
    )
    .await;

    let err = fetch_ad(&HttpAdFetcher::default(), &CdaiConfig::default(), &url)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), AdErrorKind::InvalidManifest);
}

#[tokio::test]
async fn test_fetch_ad_multi_period() {
    let (url, _server) = setup_mock_server(
        "/ads/ad1.mpd",
        ResponseTemplate::new(200).set_body_string(MULTI_PERIOD_AD_MPD),
    )
    .await;

    let err = fetch_ad(&HttpAdFetcher::default(), &CdaiConfig::default(), &url)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), AdErrorKind::InvalidMedia);
}

#[tokio::test]
async fn test_fetch_ad_bad_url() {
    fetch_ad(&HttpAdFetcher::default(), &CdaiConfig::default(), "not a url")
        .await
        .assert_error();
}

#[tokio::test]
async fn test_recording_proxy_serves_manifest() {
    let (config, proxy) =
        setup_recording_proxy(ResponseTemplate::new(200).set_body_string(AD_MPD)).await;
    let (url, _server) = setup_mock_server("/ads/ad1.mpd", ad_response()).await;

    let resolved = fetch_ad(&HttpAdFetcher::default(), &config, &url)
        .await
        .assert_success();

    assert!(resolved.url.starts_with(&format!("{}/adrec?", proxy.uri())));
    assert!(resolved.mpd.is_some());
    assert_eq!(resolved.duration_ms, 10000);
}

#[tokio::test]
async fn test_recording_proxy_starts_recording() {
    let (config, proxy) = setup_recording_proxy(ResponseTemplate::new(204)).await;
    let (url, _server) = setup_mock_server("/ads/ad1.mpd", ad_response()).await;

    let resolved = fetch_ad(&HttpAdFetcher::default(), &config, &url)
        .await
        .assert_success();

    // Playback goes through the proxy, the duration comes from the CDN.
    assert!(resolved.url.starts_with(&format!("{}/adrec?", proxy.uri())));
    assert!(resolved.mpd.is_none());
    assert_eq!(resolved.duration_ms, 10000);
}

#[tokio::test]
async fn test_recording_proxy_failure_falls_back() {
    let (config, _proxy) = setup_recording_proxy(ResponseTemplate::new(500)).await;
    let (url, _server) = setup_mock_server("/ads/ad1.mpd", ad_response()).await;

    let resolved = fetch_ad(&HttpAdFetcher::default(), &config, &url)
        .await
        .assert_success();

    assert_eq!(resolved.url, url);
    assert!(resolved.mpd.is_some());
}

#[tokio::test]
async fn test_ad_period_gets_base_url() {
    let (url, server) = setup_mock_server("/ads/ad1.mpd", ad_response()).await;

    let resolved = fetch_ad(&HttpAdFetcher::default(), &CdaiConfig::default(), &url)
        .await
        .assert_success();

    let mpd = resolved.mpd.assert_success();
    let bases: Vec<&str> = mpd.periods[0]
        .BaseURL
        .iter()
        .map(|base| base.base.as_str())
        .collect();
    assert_eq!(bases, vec![format!("{}/ads/", server.uri())]);
}

#[tokio::test]
async fn test_ad_period_inherits_manifest_base_url() {
    let body = AD_MPD.replace(
        r#"<Period id="ad0">"#,
        r#"<BaseURL>segments/</BaseURL>
  <Period id="ad0">"#,
    );
    let (url, server) = setup_mock_server(
        "/ads/ad1.mpd",
        ResponseTemplate::new(200).set_body_string(body),
    )
    .await;

    let resolved = fetch_ad(&HttpAdFetcher::default(), &CdaiConfig::default(), &url)
        .await
        .assert_success();

    let mpd = resolved.mpd.assert_success();
    assert_eq!(mpd.periods[0].BaseURL.len(), 1);
    assert_eq!(
        mpd.periods[0].BaseURL[0].base,
        format!("{}/ads/segments/", server.uri())
    );
}

#[tokio::test]
async fn test_proxy_manifest_base_url() {
    let (config, proxy) =
        setup_recording_proxy(ResponseTemplate::new(200).set_body_string(AD_MPD)).await;
    let (url, _server) = setup_mock_server("/ads/ad1.mpd", ad_response()).await;

    let resolved = fetch_ad(&HttpAdFetcher::default(), &config, &url)
        .await
        .assert_success();

    let mpd = resolved.mpd.assert_success();
    assert_eq!(mpd.periods[0].BaseURL[0].base, format!("{}/", proxy.uri()));
}
