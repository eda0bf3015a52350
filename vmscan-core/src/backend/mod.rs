//! Persistence boundary: the REST backend that stores scan configurations,
//! scans, targets and scan results.

pub mod http;

use async_trait::async_trait;
use thiserror::Error;
use vmscan_model::{
    InstanceInfo, NewScan, NewScanResult, Page, Scan, ScanConfig,
    ScanConfigId, ScanConfigPatch, ScanId, ScanPatch, ScanResultId,
    ScanResultStatus, Target,
};

pub use http::HttpBackendClient;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("scan {existing} is already running for this configuration")]
    ScanConflict { existing: ScanId },

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),
}

impl BackendError {
    /// Whether repeating the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http(err) => !err.is_decode(),
            BackendError::Status { status, .. } => {
                *status == 429 || *status >= 500
            }
            BackendError::NotFound { .. }
            | BackendError::ScanConflict { .. }
            | BackendError::InvalidResponse(_)
            | BackendError::Url(_) => false,
        }
    }
}

/// Page request for scan configuration listings. Pages are one-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfigQuery {
    pub enabled_only: bool,
    pub page: u32,
    pub page_size: u32,
}

impl ScanConfigQuery {
    pub fn enabled(page: u32, page_size: u32) -> Self {
        Self {
            enabled_only: true,
            page,
            page_size,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn list_scan_configs(
        &self,
        query: ScanConfigQuery,
    ) -> Result<Page<ScanConfig>, BackendError>;

    async fn patch_scan_config(
        &self,
        id: ScanConfigId,
        patch: &ScanConfigPatch,
    ) -> Result<(), BackendError>;

    /// Scans of `config_id` that are not yet `Done` or `Failed`.
    async fn list_active_scans(
        &self,
        config_id: ScanConfigId,
    ) -> Result<Vec<Scan>, BackendError>;

    /// Scans of every configuration that are not yet `Done` or `Failed`.
    async fn list_unfinished_scans(&self) -> Result<Vec<Scan>, BackendError>;

    async fn get_scan(&self, id: ScanId) -> Result<Scan, BackendError>;

    /// Create a scan. Fails with [`BackendError::ScanConflict`] when a
    /// non-terminal scan already exists for the same configuration.
    async fn create_scan(&self, scan: &NewScan) -> Result<Scan, BackendError>;

    async fn patch_scan(
        &self,
        id: ScanId,
        patch: &ScanPatch,
    ) -> Result<(), BackendError>;

    /// Idempotent: an already-known instance resolves to its stored target.
    async fn create_or_get_target(
        &self,
        instance: &InstanceInfo,
    ) -> Result<Target, BackendError>;

    /// Idempotent: a result that already exists for the same scan and target
    /// resolves to its id.
    async fn create_scan_result(
        &self,
        result: &NewScanResult,
    ) -> Result<ScanResultId, BackendError>;

    async fn get_scan_result_status(
        &self,
        id: ScanResultId,
    ) -> Result<ScanResultStatus, BackendError>;

    async fn patch_scan_result_status(
        &self,
        id: ScanResultId,
        status: &ScanResultStatus,
    ) -> Result<(), BackendError>;
}
