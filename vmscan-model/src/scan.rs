use std::fmt;
use std::str::FromStr;

use crate::chrono::{DateTime, Utc};
use crate::error::ModelError;
use crate::ids::{ScanConfigId, ScanId, TargetId};
use crate::scan_config::{
    RuntimeSchedule, ScanConfig, ScanFamiliesConfig, ScanScope,
};

/// Lifecycle of a scan run.
///
/// `Aborted` is an operator request; the engine finalises an aborted scan
/// into `Failed` with [`ScanStateReason::Aborted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanState {
    Pending,
    Discovered,
    InProgress,
    Aborted,
    Done,
    Failed,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanState::Done | ScanState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanState::Pending => "Pending",
            ScanState::Discovered => "Discovered",
            ScanState::InProgress => "InProgress",
            ScanState::Aborted => "Aborted",
            ScanState::Done => "Done",
            ScanState::Failed => "Failed",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(ScanState::Pending),
            "Discovered" => Ok(ScanState::Discovered),
            "InProgress" => Ok(ScanState::InProgress),
            "Aborted" => Ok(ScanState::Aborted),
            "Done" => Ok(ScanState::Done),
            "Failed" => Ok(ScanState::Failed),
            other => Err(ModelError::InvalidState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanStateReason {
    Discovered,
    NothingToScan,
    TargetScansRunning,
    Success,
    OneOrMoreTargetFailedToScan,
    TimedOut,
    Aborted,
    DiscoveryFailed,
    Unexpected,
}

impl fmt::Display for ScanStateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScanStateReason::Discovered => "Discovered",
            ScanStateReason::NothingToScan => "NothingToScan",
            ScanStateReason::TargetScansRunning => "TargetScansRunning",
            ScanStateReason::Success => "Success",
            ScanStateReason::OneOrMoreTargetFailedToScan => {
                "OneOrMoreTargetFailedToScan"
            }
            ScanStateReason::TimedOut => "TimedOut",
            ScanStateReason::Aborted => "Aborted",
            ScanStateReason::DiscoveryFailed => "DiscoveryFailed",
            ScanStateReason::Unexpected => "Unexpected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct VulnerabilityCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub negligible: u32,
}

/// Aggregated progress and finding counters for a scan.
///
/// The engine only writes the job counters; finding totals are filled in by
/// result ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct ScanSummary {
    pub jobs_completed: u32,
    pub jobs_left_to_run: u32,
    pub total_packages: u32,
    pub total_exploits: u32,
    pub total_malware: u32,
    pub total_misconfigurations: u32,
    pub total_rootkits: u32,
    pub total_secrets: u32,
    pub total_vulnerabilities: VulnerabilityCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ScanSummaryPatch {
    pub jobs_completed: u32,
    pub jobs_left_to_run: u32,
}

/// Copy of the configuration a scan was started from.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ScanConfigSnapshot {
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub scope: ScanScope,
    #[cfg_attr(feature = "serde", serde(default))]
    pub families: ScanFamiliesConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub scheduled: Option<RuntimeSchedule>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub max_parallel_scanners: Option<u32>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub timeout_seconds: Option<u64>,
}

impl From<&ScanConfig> for ScanConfigSnapshot {
    fn from(config: &ScanConfig) -> Self {
        Self {
            name: config.name.clone(),
            scope: config.scope.clone(),
            families: config.families,
            scheduled: config.scheduled.clone(),
            max_parallel_scanners: config.max_parallel_scanners,
            timeout_seconds: config.timeout_seconds,
        }
    }
}

/// One execution of a scan configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Scan {
    pub id: ScanId,
    pub scan_config_id: ScanConfigId,
    pub config_snapshot: ScanConfigSnapshot,
    pub start_time: DateTime<Utc>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub end_time: Option<DateTime<Utc>>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub target_ids: Vec<TargetId>,
    pub state: ScanState,
    #[cfg_attr(feature = "serde", serde(default))]
    pub state_reason: Option<ScanStateReason>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub state_message: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub summary: ScanSummary,
    /// Last liveness mark written by the orchestrator running the scan.
    #[cfg_attr(feature = "serde", serde(default))]
    pub heartbeat_time: Option<DateTime<Utc>>,
}

impl Scan {
    /// Materialise a scan from its creation payload, as a backend would.
    pub fn from_new(id: ScanId, new: NewScan) -> Self {
        Self {
            id,
            scan_config_id: new.scan_config_id,
            config_snapshot: new.config_snapshot,
            start_time: new.start_time,
            end_time: None,
            target_ids: Vec::new(),
            state: new.state,
            state_reason: None,
            state_message: None,
            summary: new.summary,
            heartbeat_time: None,
        }
    }

    /// When an orchestrator last showed it was working on this scan.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.heartbeat_time
            .map_or(self.start_time, |beat| beat.max(self.start_time))
    }

    /// Apply a sparse patch in place.
    pub fn apply(&mut self, patch: &ScanPatch) {
        if let Some(state) = patch.state {
            self.state = state;
        }
        if let Some(reason) = patch.state_reason {
            self.state_reason = Some(reason);
        }
        if let Some(message) = &patch.state_message {
            self.state_message = Some(message.clone());
        }
        if let Some(end) = patch.end_time {
            self.end_time = Some(end);
        }
        if let Some(targets) = &patch.target_ids {
            self.target_ids = targets.clone();
        }
        if let Some(beat) = patch.heartbeat_time {
            self.heartbeat_time = Some(beat);
        }
        if let Some(jobs) = patch.summary {
            self.summary.jobs_completed = jobs.jobs_completed;
            self.summary.jobs_left_to_run = jobs.jobs_left_to_run;
        }
    }
}

/// Creation payload for a scan. New scans always start with a zeroed
/// summary.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct NewScan {
    pub scan_config_id: ScanConfigId,
    pub config_snapshot: ScanConfigSnapshot,
    pub start_time: DateTime<Utc>,
    pub state: ScanState,
    pub summary: ScanSummary,
}

impl NewScan {
    pub fn pending(config: &ScanConfig, now: DateTime<Utc>) -> Self {
        Self {
            scan_config_id: config.id,
            config_snapshot: ScanConfigSnapshot::from(config),
            start_time: now,
            state: ScanState::Pending,
            summary: ScanSummary::default(),
        }
    }

    /// A fresh pending run carrying the same configuration snapshot as
    /// `scan`.
    pub fn rerun_of(scan: &Scan, now: DateTime<Utc>) -> Self {
        Self {
            scan_config_id: scan.scan_config_id,
            config_snapshot: scan.config_snapshot.clone(),
            start_time: now,
            state: ScanState::Pending,
            summary: ScanSummary::default(),
        }
    }
}

/// Sparse scan update; `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct ScanPatch {
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub state: Option<ScanState>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub state_reason: Option<ScanStateReason>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub state_message: Option<String>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub end_time: Option<DateTime<Utc>>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub target_ids: Option<Vec<TargetId>>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub summary: Option<ScanSummaryPatch>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub heartbeat_time: Option<DateTime<Utc>>,
}

impl ScanPatch {
    pub fn state(
        state: ScanState,
        reason: ScanStateReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            state: Some(state),
            state_reason: Some(reason),
            state_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn heartbeat(now: DateTime<Utc>) -> Self {
        Self {
            heartbeat_time: Some(now),
            ..Self::default()
        }
    }

    pub fn with_end_time(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn with_targets(mut self, targets: Vec<TargetId>) -> Self {
        self.target_ids = Some(targets);
        self
    }

    pub fn with_jobs(mut self, completed: u32, left: u32) -> Self {
        self.summary = Some(ScanSummaryPatch {
            jobs_completed: completed,
            jobs_left_to_run: left,
        });
        self
    }
}
