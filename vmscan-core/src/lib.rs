//! Scheduling, provisioning and tracking of agentless VM security scans.
//!
//! The [`Orchestrator`] wires a [`ScanConfigWatcher`] that fires due scan
//! configurations into a [`Scanner`] that snapshots every discovered target,
//! mounts the snapshot on a short-lived scanner instance and waits for the
//! scanner to report back. Scans abandoned by a stopped orchestrator are
//! settled by the [`OrphanSweeper`].

pub mod backend;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod recovery;
pub mod scanner;
pub mod schedule;
pub mod watcher;

pub use backend::{BackendClient, BackendError, HttpBackendClient, ScanConfigQuery};
pub use config::{
    DeleteJobPolicy, OrchestratorConfig, PlacementConfig, ScannerConfig,
    ScannerToolsConfig, WatcherConfig,
};
pub use error::{CoreError, Result};
pub use orchestrator::{ActiveScans, Orchestrator};
pub use provider::{ProviderClient, ProviderError, ProviderKind};
pub use recovery::{Disposition, OrphanSweeper};
pub use scanner::{ScanOutcome, Scanner};
pub use schedule::{
    CronExpression, OperationTime, ScanConfigSchedule, ScheduleError,
    ScheduleState, ScheduleWindow,
};
pub use watcher::{FireOrigin, FiredScan, ScanConfigWatcher};

pub use vmscan_model as model;
