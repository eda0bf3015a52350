use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendError;
use crate::provider::ProviderError;
use crate::provider::retry::WaitError;
use crate::schedule::ScheduleError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Timed out waiting for {what} after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("Timed out waiting for the scanner to report after {0:?}")]
    ResultTimeout(Duration),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Lift a wait failure into the crate error, naming what was awaited.
    pub fn from_wait(what: impl Into<String>, err: WaitError) -> Self {
        match err {
            WaitError::Provider(err) => CoreError::Provider(err),
            WaitError::Timeout(after) => CoreError::Timeout {
                what: what.into(),
                after,
            },
            WaitError::Cancelled => CoreError::Cancelled(what.into()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
