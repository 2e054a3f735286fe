use std::{future::Future, sync::Arc};

use bytes::Bytes;
use dash_mpd::{BaseURL, MPD};
use reqwest::{Client, ClientBuilder, StatusCode};
use url::Url;

use crate::{
    config::CdaiConfig,
    error::{CdaiError, CdaiResult},
    manifest::{ad_duration_ms, parse_ad_manifest},
    state::ResolvedAd,
};

pub struct FetchResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Downloads ad manifests.
///
/// Implementations report a non-success HTTP status as
/// [`CdaiError::HttpError`] and a transport failure as any other error.
pub trait AdFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &Url) -> impl Future<Output = CdaiResult<FetchResponse>> + Send;
}

#[derive(Clone)]
pub struct HttpAdFetcher {
    client: Client,
}

impl HttpAdFetcher {
    pub fn new(builder: ClientBuilder) -> CdaiResult<Self> {
        Ok(Self {
            client: builder.build()?,
        })
    }

    pub fn from_config(config: &CdaiConfig) -> CdaiResult<Self> {
        Self::new(Client::builder().timeout(config.request_timeout()))
    }
}

impl Default for HttpAdFetcher {
    fn default() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl AdFetcher for HttpAdFetcher {
    async fn fetch(&self, url: &Url) -> CdaiResult<FetchResponse> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CdaiError::HttpError(status));
        }

        let body = response.bytes().await?;
        Ok(FetchResponse { status, body })
    }
}

/// Location of `cdn_url` on the recording proxy.
pub fn recording_url(proxy: &Url, cdn_url: &str) -> CdaiResult<Url> {
    let mut url = proxy.join("adrec")?;
    url.query_pairs_mut()
        .append_pair("clientId", "FOG_AAMP")
        .append_pair("recordedUrl", cdn_url);
    Ok(url)
}

/// Parses an ad manifest downloaded from `manifest_url`.
///
/// The ad period always ends up with a `BaseURL`: the manifest's own one,
/// or else the directory of `manifest_url`. Its segments then resolve
/// without knowing where the manifest came from.
fn parse_fetched_ad(body: &[u8], manifest_url: &Url) -> CdaiResult<MPD> {
    let mut mpd = parse_ad_manifest(&String::from_utf8_lossy(body))?;

    let Some(period) = mpd.periods.first_mut() else {
        return Ok(mpd);
    };
    if period.BaseURL.is_empty() {
        let base = match mpd.base_url.first() {
            Some(base) => manifest_url.join(&base.base)?,
            None => manifest_url.join(".")?,
        };
        tracing::debug!(base = %base, "Adding BaseURL to ad period");
        period.BaseURL.push(BaseURL {
            base: base.to_string(),
            ..Default::default()
        });
    }
    Ok(mpd)
}

async fn fetch_from_cdn<F: AdFetcher>(fetcher: &F, url: &str) -> CdaiResult<ResolvedAd> {
    let cdn_url = Url::parse(url)?;
    let response = fetcher.fetch(&cdn_url).await?;
    let mpd = parse_fetched_ad(&response.body, &cdn_url)?;

    Ok(ResolvedAd {
        duration_ms: ad_duration_ms(&mpd),
        mpd: Some(Arc::new(mpd)),
        url: url.to_string(),
    })
}

/// Fetches and validates the manifest of one ad.
///
/// With a recording proxy configured the proxy is asked for the ad once the
/// CDN manifest is known. Any failure of the proxy falls back to the CDN
/// manifest.
pub async fn fetch_ad<F: AdFetcher>(
    fetcher: &F,
    config: &CdaiConfig,
    url: &str,
) -> CdaiResult<ResolvedAd> {
    let cdn = fetch_from_cdn(fetcher, url).await?;
    let Some(proxy) = &config.recording_proxy else {
        return Ok(cdn);
    };

    let proxy_url = match recording_url(proxy, url) {
        Ok(proxy_url) => proxy_url,
        Err(e) => {
            tracing::warn!(url, "Invalid recording proxy URL, using CDN: {e}");
            return Ok(cdn);
        }
    };
    match fetcher.fetch(&proxy_url).await {
        // Recording has started, the final manifest is served later.
        Ok(response) if response.status == StatusCode::NO_CONTENT => {
            tracing::info!(url = %proxy_url, "Ad is being recorded, final manifest comes later");
            Ok(ResolvedAd {
                mpd: None,
                url: proxy_url.to_string(),
                ..cdn
            })
        }
        Ok(response) => match parse_fetched_ad(&response.body, &proxy_url) {
            Ok(mpd) => Ok(ResolvedAd {
                duration_ms: ad_duration_ms(&mpd),
                mpd: Some(Arc::new(mpd)),
                url: proxy_url.to_string(),
            }),
            Err(e) => {
                tracing::warn!(url = %proxy_url, "Invalid ad manifest from recording proxy, using CDN: {e}");
                Ok(cdn)
            }
        },
        Err(e) => {
            tracing::warn!(url = %proxy_url, "Recording proxy failed, using CDN: {e}");
            Ok(cdn)
        }
    }
}
