use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context};
use cdai::{AdManager, AdResolvedEvent, CdaiConfig, SourceManifest};
use clap::Parser;
use tokio::sync::mpsc::UnboundedReceiver;

/// Replays ad announcements and manifest snapshots through the placement
/// engine and prints the resulting placement.
#[derive(Parser, Debug, Clone)]
#[clap(name = "cdai-replay", version)]
struct ReplayArgs {
    /// Engine configuration in TOML
    #[clap(long)]
    config: Option<PathBuf>,

    /// Ad break signaled at a period, as `<period_id>:<duration_ms>`
    #[clap(long = "break")]
    breaks: Vec<BreakArg>,

    /// Ad of a break, as `<period_id>:<ad_id>:<url>`
    #[clap(long = "ad")]
    ads: Vec<AdArg>,

    /// Time to wait for each ad manifest, in milliseconds
    #[clap(long)]
    timeout: Option<u64>,

    /// MPD snapshots, in refresh order
    snapshots: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
struct BreakArg {
    period_id: String,
    duration_ms: u64,
}

impl FromStr for BreakArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((period_id, duration)) = s.rsplit_once(':') else {
            bail!("expected <period_id>:<duration_ms>, got {s}");
        };
        Ok(Self {
            period_id: period_id.to_string(),
            duration_ms: duration.parse().context("invalid break duration")?,
        })
    }
}

#[derive(Debug, Clone)]
struct AdArg {
    period_id: String,
    ad_id: String,
    url: String,
}

impl FromStr for AdArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(period_id), Some(ad_id), Some(url)) if !url.is_empty() => Ok(Self {
                period_id: period_id.to_string(),
                ad_id: ad_id.to_string(),
                url: url.to_string(),
            }),
            _ => bail!("expected <period_id>:<ad_id>:<url>, got {s}"),
        }
    }
}

/// Moves every event already delivered on `events` into `out`.
fn drain_events(events: &mut UnboundedReceiver<AdResolvedEvent>, out: &mut Vec<AdResolvedEvent>) {
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .try_from_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = ReplayArgs::parse();
    let config = match &args.config {
        Some(path) => CdaiConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => CdaiConfig::default(),
    };
    let timeout = args
        .timeout
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.ad_fulfill_timeout());

    let (manager, mut events) = AdManager::with_http(config)?;

    for brk in &args.breaks {
        manager.set_alternate_contents(&brk.period_id, "", "", brk.duration_ms);
    }
    for ad in &args.ads {
        let break_duration = args
            .breaks
            .iter()
            .find(|brk| brk.period_id == ad.period_id)
            .map(|brk| brk.duration_ms)
            .unwrap_or_default();
        manager.set_alternate_contents(&ad.period_id, &ad.ad_id, &ad.url, break_duration);
        if !manager.wait_for_next_ad_resolved(timeout).await {
            tracing::warn!(ad_id = %ad.ad_id, "Ad not resolved in time");
        }
    }

    let mut resolutions = Vec::new();
    drain_events(&mut events, &mut resolutions);

    for path in &args.snapshots {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        let snapshot = SourceManifest::parse(&text)
            .with_context(|| format!("failed to parse snapshot {}", path.display()))?;

        tracing::info!(snapshot = %path.display(), periods = snapshot.periods.len(), "Placing ads");
        manager.place_ads(&snapshot);
    }

    // Ads that timed out above may have resolved while snapshots were placed.
    drain_events(&mut events, &mut resolutions);
    let output = {
        let state = manager.state();
        serde_json::json!({
            "events": resolutions,
            "breaks": state.ad_breaks(),
            "periods": state.periods(),
            "pending_breaks": state.pending_breaks(),
        })
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
