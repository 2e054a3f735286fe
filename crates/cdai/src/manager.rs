use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    config::CdaiConfig,
    error::CdaiResult,
    event::AdResolvedEvent,
    fulfill::{fetch_ad, AdFetcher, HttpAdFetcher},
    manifest::SourceManifest,
    model::AdFulfillObj,
    query::AdMatch,
    state::CdaiState,
};

struct Shared {
    config: Arc<CdaiConfig>,
    state: Mutex<CdaiState>,
    /// The most recently announced ad, the one `wait_for_next_ad_resolved`
    /// waits for.
    next_fulfill: Mutex<Option<AdFulfillObj>>,
    /// Woken whenever an ad resolution completes or a wait is aborted.
    resolved: Notify,
    downloads_enabled: AtomicBool,
    downloads_resumed: Notify,
    events: mpsc::UnboundedSender<AdResolvedEvent>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, CdaiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn downloads_enabled(&self) -> bool {
        self.downloads_enabled.load(Ordering::Acquire)
    }

    fn send_event(&self, event: AdResolvedEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

enum NextAd {
    Missing,
    Pending,
    Resolved,
}

/// Client-side ad insertion for one stream.
///
/// Ad manifests are fulfilled one at a time by a background task, while
/// placement and lookups run synchronously on the caller's side. Both share
/// the engine state behind a single lock.
pub struct AdManager<F: AdFetcher = HttpAdFetcher> {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<AdFulfillObj>,
    worker: JoinHandle<()>,
    _fetcher: std::marker::PhantomData<fn() -> F>,
}

impl AdManager<HttpAdFetcher> {
    pub fn with_http(
        config: CdaiConfig,
    ) -> CdaiResult<(Self, mpsc::UnboundedReceiver<AdResolvedEvent>)> {
        let fetcher = HttpAdFetcher::from_config(&config)?;
        Ok(Self::new(config, fetcher))
    }
}

impl<F: AdFetcher> AdManager<F> {
    /// Creates the manager and starts its fulfillment task. Must be called
    /// within a Tokio runtime.
    ///
    /// Every ad resolution outcome is delivered on the returned receiver.
    pub fn new(
        config: CdaiConfig,
        fetcher: F,
    ) -> (Self, mpsc::UnboundedReceiver<AdResolvedEvent>) {
        let config = Arc::new(config);
        let (events, events_rx) = mpsc::unbounded_channel();
        let (queue, queue_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            state: Mutex::new(CdaiState::new(config.clone())),
            config,
            next_fulfill: Mutex::new(None),
            resolved: Notify::new(),
            downloads_enabled: AtomicBool::new(true),
            downloads_resumed: Notify::new(),
            events,
        });
        let worker = tokio::spawn(fulfill_loop(shared.clone(), fetcher, queue_rx));

        let manager = Self {
            shared,
            queue,
            worker,
            _fetcher: std::marker::PhantomData,
        };
        (manager, events_rx)
    }

    pub fn config(&self) -> &CdaiConfig {
        &self.shared.config
    }

    /// Locks the engine state for direct inspection or maintenance.
    pub fn state(&self) -> MutexGuard<'_, CdaiState> {
        self.shared.state()
    }

    /// Announces an ad break (empty `ad_id`) or an ad of the break signaled
    /// at `period_id`.
    ///
    /// A rejected ad is reported on the event channel right away. An accepted
    /// one is reported once its manifest has been fulfilled.
    pub fn set_alternate_contents(
        &self,
        period_id: &str,
        ad_id: &str,
        url: &str,
        break_duration_ms: u64,
    ) {
        let announced = self.shared.state().set_alternate_contents(
            period_id,
            ad_id,
            url,
            break_duration_ms,
        );

        match announced {
            Ok(Some(obj)) => {
                *self
                    .shared
                    .next_fulfill
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(obj.clone());
                if self.queue.send(obj).is_err() {
                    tracing::error!(period_id, ad_id, "Ad fulfillment task is gone");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(period_id, ad_id, "Rejected ad: {e}");
                self.shared
                    .send_event(AdResolvedEvent::failed(ad_id, e.kind()));
            }
        }
    }

    pub fn place_ads(&self, manifest: &SourceManifest) {
        self.shared.state().place_ads(manifest);
    }

    pub fn check_for_ad_start(
        &self,
        rate: f32,
        init: bool,
        period_id: &str,
        offset: f64,
    ) -> Option<AdMatch> {
        self.shared
            .state()
            .check_for_ad_start(rate, init, period_id, offset)
    }

    pub fn check_for_ad_terminate(&self, offset: f64) -> bool {
        self.shared.state().check_for_ad_terminate(offset)
    }

    pub fn prune_period_maps(&self, period_ids: &[String]) {
        self.shared.state().prune_period_maps(period_ids);
    }

    pub fn downloads_enabled(&self) -> bool {
        self.shared.downloads_enabled()
    }

    /// Disabling downloads releases every waiter and pauses fulfillment
    /// before its next fetch.
    pub fn set_downloads_enabled(&self, enabled: bool) {
        self.shared
            .downloads_enabled
            .store(enabled, Ordering::Release);
        if enabled {
            self.shared.downloads_resumed.notify_waiters();
        } else {
            self.shared.resolved.notify_waiters();
        }
    }

    /// Stops ad fulfillment. Ads still queued are never resolved.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down ad fulfillment");
        self.worker.abort();
        self.shared.resolved.notify_waiters();
    }

    /// Makes every waiter check its condition again.
    pub fn abort_wait_for_next_ad_resolved(&self) {
        tracing::info!("Aborting wait for next ad resolution");
        self.shared.resolved.notify_waiters();
    }

    fn next_ad(&self) -> NextAd {
        let next = self
            .shared
            .next_fulfill
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(obj) = next else {
            return NextAd::Missing;
        };

        let state = self.shared.state();
        match state
            .ad_break(&obj.period_id)
            .and_then(|brk| brk.ads.iter().find(|ad| ad.ad_id == obj.ad_id))
        {
            None => NextAd::Missing,
            Some(ad) if ad.resolved => NextAd::Resolved,
            Some(_) => NextAd::Pending,
        }
    }

    /// Waits until the last announced ad is resolved.
    ///
    /// Returns `false` when there is no such ad or on timeout, and `true`
    /// right away when downloads are disabled.
    pub async fn wait_for_next_ad_resolved(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.next_ad() {
                NextAd::Missing => return false,
                NextAd::Resolved => return true,
                NextAd::Pending if !self.shared.downloads_enabled() => return true,
                NextAd::Pending => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::info!("Timed out waiting for next ad resolution");
                return matches!(self.next_ad(), NextAd::Resolved);
            }
        }
    }

    /// Waits until an ad of the break signaled at `period_id` is resolved.
    /// On timeout the break is invalidated and no further ad is accepted.
    pub async fn wait_for_ad_break_resolved(&self, period_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.resolved.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.shared.state();
                let Some(brk) = state.ad_break(period_id) else {
                    tracing::info!(period_id, "Ad break not found while waiting");
                    return false;
                };
                if brk.resolved || !self.shared.downloads_enabled() {
                    return true;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut state = self.shared.state();
                if state.ad_break(period_id).is_some_and(|brk| brk.resolved) {
                    return true;
                }
                state.invalidate_break(period_id);
                return false;
            }
        }
    }
}

impl<F: AdFetcher> Drop for AdManager<F> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn fulfill_loop<F: AdFetcher>(
    shared: Arc<Shared>,
    fetcher: F,
    mut queue: mpsc::UnboundedReceiver<AdFulfillObj>,
) {
    while let Some(obj) = queue.recv().await {
        while !shared.downloads_enabled() {
            let resumed = shared.downloads_resumed.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();
            if shared.downloads_enabled() {
                break;
            }
            tracing::debug!("Downloads disabled, ad fulfillment paused");
            resumed.await;
        }

        tracing::info!(ad_id = %obj.ad_id, url = %obj.url, "Fulfilling ad");
        let outcome = fetch_ad(&fetcher, &shared.config, &obj.url).await;
        let event = shared.state().apply_resolution(&obj, outcome);

        shared.resolved.notify_waiters();
        shared.send_event(event);
    }
    tracing::debug!("Ad fulfillment task exited");
}
