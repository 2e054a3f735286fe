pub mod config;
pub mod error;
pub mod event;
pub mod fulfill;
pub mod manager;
pub mod manifest;
pub mod model;
pub mod placement;
pub mod query;
pub mod state;

pub use config::CdaiConfig;
pub use error::{AdErrorKind, CdaiError, CdaiResult};
pub use event::AdResolvedEvent;
pub use fulfill::{AdFetcher, FetchResponse, HttpAdFetcher};
pub use manager::AdManager;
pub use manifest::{SegmentTimeline, SourceManifest, SourcePeriod, TimelineEntry};
pub use model::{AdBreak, AdFulfillObj, AdNode, AdOnPeriod, PeriodAdData, TimelinePoint};
pub use placement::{Placement, PlacementCursor};
pub use query::AdMatch;
pub use state::{CdaiState, ResolvedAd};
