//! Provider error taxonomy.
//!
//! Every error leaving a [`ProviderClient`](super::ProviderClient) is either
//! [`ProviderError::Fatal`] or [`ProviderError::Retryable`]. [`classify`]
//! turns raw cloud/transport errors into one of the two.

use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Delay suggested for transient errors without a better hint.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(15);
/// Delay suggested when the cloud API reports a server-side fault.
pub const SERVER_FAULT_RETRY_AFTER: Duration = Duration::from_secs(60);
/// Delay used for retryable plugin errors that carry no hint of their own.
pub const PLUGIN_RETRY_AFTER: Duration = Duration::from_secs(120);

/// Error codes that mean the orchestrator's credentials are not allowed to
/// perform the call. Retrying never helps.
const AUTHORIZATION_DENIED_CODES: &[&str] = &[
    "UnauthorizedOperation",
    "AuthorizationFailed",
    "AccessDenied",
    "Forbidden",
];

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("fatal provider error: {source}")]
    Fatal {
        #[source]
        source: BoxError,
    },

    #[error("retryable provider error (retry after {after:?}): {source}")]
    Retryable {
        #[source]
        source: BoxError,
        after: Duration,
    },
}

impl ProviderError {
    pub fn fatal(err: impl Into<BoxError>) -> Self {
        ProviderError::Fatal { source: err.into() }
    }

    pub fn retryable(err: impl Into<BoxError>, after: Duration) -> Self {
        ProviderError::Retryable {
            source: err.into(),
            after,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Retryable { after, .. } => Some(*after),
            ProviderError::Fatal { .. } => None,
        }
    }
}

/// Which side of a cloud API call a fault is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Client,
    Server,
    Unknown,
}

/// Structured error as reported by a cloud SDK.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} ({fault:?} fault): {message}")]
pub struct CloudApiError {
    pub code: String,
    pub fault: FaultKind,
    pub message: String,
}

impl CloudApiError {
    pub fn new(
        code: impl Into<String>,
        fault: FaultKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            fault,
            message: message.into(),
        }
    }

    fn is_authorization_denied(&self) -> bool {
        AUTHORIZATION_DENIED_CODES.contains(&self.code.as_str())
    }
}

/// Wrap an arbitrary error into the provider taxonomy.
///
/// Already-classified errors pass through unchanged, so classifying twice is
/// a no-op.
pub fn classify(err: impl Into<BoxError>) -> ProviderError {
    let err: BoxError = err.into();
    let err = match err.downcast::<ProviderError>() {
        Ok(classified) => return *classified,
        Err(err) => err,
    };

    if let Some(api) = err.downcast_ref::<CloudApiError>() {
        let (denied, fault) = (api.is_authorization_denied(), api.fault);
        if denied {
            return ProviderError::fatal(err);
        }
        return match fault {
            FaultKind::Server => {
                ProviderError::retryable(err, SERVER_FAULT_RETRY_AFTER)
            }
            FaultKind::Client | FaultKind::Unknown => ProviderError::fatal(err),
        };
    }

    if let Some(status) = err
        .downcast_ref::<reqwest::Error>()
        .and_then(reqwest::Error::status)
    {
        return match status.as_u16() {
            401 | 403 => ProviderError::fatal(err),
            429 => ProviderError::retryable(err, DEFAULT_RETRY_AFTER),
            500..=599 => ProviderError::retryable(err, SERVER_FAULT_RETRY_AFTER),
            400..=499 => ProviderError::fatal(err),
            _ => ProviderError::retryable(err, DEFAULT_RETRY_AFTER),
        };
    }

    ProviderError::retryable(err, DEFAULT_RETRY_AFTER)
}
