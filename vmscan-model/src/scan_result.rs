use std::fmt;

use crate::chrono::{DateTime, Utc};
use crate::ids::{ScanId, ScanResultId, TargetId};

/// Backend-visible state of a single target scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum ScanResultState {
    Init,
    Attached,
    InProgress,
    Aborted,
    Done,
    NotScanned,
}

impl ScanResultState {
    /// `Done` and `NotScanned` end the target scan.
    pub fn is_final(self) -> bool {
        matches!(self, ScanResultState::Done | ScanResultState::NotScanned)
    }
}

impl fmt::Display for ScanResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScanResultState::Init => "INIT",
            ScanResultState::Attached => "ATTACHED",
            ScanResultState::InProgress => "IN_PROGRESS",
            ScanResultState::Aborted => "ABORTED",
            ScanResultState::Done => "DONE",
            ScanResultState::NotScanned => "NOT_SCANNED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct ScanResultStatus {
    pub state: Option<ScanResultState>,
    pub errors: Vec<String>,
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl ScanResultStatus {
    pub fn new(state: ScanResultState, now: DateTime<Utc>) -> Self {
        Self {
            state: Some(state),
            errors: Vec::new(),
            last_transition_time: Some(now),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Per-target scan result record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ScanResult {
    pub id: ScanResultId,
    pub scan_id: ScanId,
    pub target_id: TargetId,
    #[cfg_attr(feature = "serde", serde(default))]
    pub status: ScanResultStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct NewScanResult {
    pub scan_id: ScanId,
    pub target_id: TargetId,
    pub status: ScanResultStatus,
}

impl NewScanResult {
    pub fn init(scan_id: ScanId, target_id: TargetId, now: DateTime<Utc>) -> Self {
        Self {
            scan_id,
            target_id,
            status: ScanResultStatus::new(ScanResultState::Init, now),
        }
    }
}
