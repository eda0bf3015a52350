//! Records shared by the vmscan crates: scan configurations, scans, targets
//! and per-target scan results.
#![allow(missing_docs)]

pub use ::chrono;

pub mod error;
pub mod ids;
pub mod page;
pub mod scan;
pub mod scan_config;
pub mod scan_result;
pub mod target;

pub use error::{ModelError, Result as ModelResult};
pub use ids::{ScanConfigId, ScanId, ScanResultId, TargetId};
pub use page::Page;
pub use scan::{
    NewScan, Scan, ScanConfigSnapshot, ScanPatch, ScanState, ScanStateReason,
    ScanSummary, ScanSummaryPatch, VulnerabilityCounts,
};
pub use scan_config::{
    RegionScope, RuntimeSchedule, ScanConfig, ScanConfigPatch,
    ScanFamiliesConfig, ScanScope, Tag, VpcScope,
};
pub use scan_result::{
    NewScanResult, ScanResult, ScanResultState, ScanResultStatus,
};
pub use target::{InstanceInfo, Target, TargetInstance};
