use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdaiError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    MpdParseError(#[from] dash_mpd::DashMpdError),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error("Ad manifest has {0} periods, expected exactly one")]
    MultiPeriodAd(usize),

    #[error("Ad manifest has no period")]
    EmptyAd,

    #[error("Ad {0} was invalidated while its manifest was being fetched")]
    AdInvalidated(String),

    #[error("No ad break exists for period {0}")]
    UnknownBreak(String),

    #[error("Ad break {0} was invalidated by a decisioning timeout")]
    BreakTimedOut(String),

    #[error("Ad break {break_id} is full: {ads_duration}ms of {break_duration}ms used")]
    BreakFull {
        break_id: String,
        ads_duration: u64,
        break_duration: u64,
    },

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    TomlError(#[from] toml::de::Error),
}

pub type CdaiResult<T> = Result<T, CdaiError>;

/// Outcome codes reported with every ad resolution event.
///
/// None of them is fatal to playback: a failed ad is skipped and the source
/// content plays instead.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdErrorKind {
    #[default]
    None,
    Unknown,
    DecisioningTimeout,
    InvalidSpecification,
    DeliveryError,
    DeliveryHttpError,
    DeliveryTimeout,
    InvalidManifest,
    InvalidMedia,
}

impl CdaiError {
    pub fn kind(&self) -> AdErrorKind {
        match self {
            CdaiError::HttpError(_) => AdErrorKind::DeliveryHttpError,
            CdaiError::RequestError(e) if e.status().is_some() => AdErrorKind::DeliveryHttpError,
            CdaiError::RequestError(_) | CdaiError::IOError(_) | CdaiError::UrlParseError(_) => {
                AdErrorKind::DeliveryError
            }
            CdaiError::MpdParseError(_) => AdErrorKind::InvalidManifest,
            CdaiError::MultiPeriodAd(_) | CdaiError::EmptyAd => AdErrorKind::InvalidMedia,
            CdaiError::AdInvalidated(_) => AdErrorKind::DeliveryTimeout,
            CdaiError::UnknownBreak(_) => AdErrorKind::Unknown,
            CdaiError::BreakTimedOut(_) => AdErrorKind::DecisioningTimeout,
            CdaiError::BreakFull { .. } => AdErrorKind::InvalidSpecification,
            CdaiError::TomlError(_) => AdErrorKind::Unknown,
        }
    }
}
