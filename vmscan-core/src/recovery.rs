//! Recovery of scans left unfinished by an orchestrator that stopped or
//! crashed before writing a terminal state.
//!
//! Every orchestrator marks the scans it runs with a heartbeat once per poll
//! interval. An unfinished scan that nobody has marked for longer than the
//! orphan timeout is settled here: pending scans are replaced by a fresh run,
//! anything further along is failed. Replacement runs go through
//! [`BackendClient::create_scan`], so concurrent sweepers cannot both start
//! one.

use std::any::type_name_of_val;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use vmscan_model::{NewScan, Scan, ScanPatch, ScanState, ScanStateReason};

use crate::backend::{BackendClient, BackendError};
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::orchestrator::ActiveScans;
use crate::watcher::{FireOrigin, FiredScan};

/// What to do with an abandoned scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Never started: fail it and start a replacement run.
    Rerun,
    /// Fail it for good.
    Fail {
        reason: ScanStateReason,
        message: String,
    },
}

impl Disposition {
    /// Decide how to settle `scan`, assuming nobody is running it.
    ///
    /// Returns `None` for scans that are already terminal.
    pub fn of(scan: &Scan, now: DateTime<Utc>, scan_timeout: Duration) -> Option<Self> {
        let timeout = scan
            .config_snapshot
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(scan_timeout);
        let expired = (now - scan.start_time)
            .to_std()
            .is_ok_and(|age| age >= timeout);

        let disposition = match scan.state {
            ScanState::Done | ScanState::Failed => return None,
            ScanState::Aborted => Disposition::Fail {
                reason: ScanStateReason::Aborted,
                message: "Scan has been aborted".to_string(),
            },
            _ if expired => Disposition::Fail {
                reason: ScanStateReason::TimedOut,
                message: format!("Scan timed out after {}s", timeout.as_secs()),
            },
            ScanState::Pending => Disposition::Rerun,
            ScanState::Discovered | ScanState::InProgress => Disposition::Fail {
                reason: ScanStateReason::Unexpected,
                message: "Scan was abandoned by the orchestrator running it"
                    .to_string(),
            },
        };
        Some(disposition)
    }
}

/// Finds and settles scans no orchestrator is working on.
pub struct OrphanSweeper {
    backend: Arc<dyn BackendClient>,
    orphan_timeout: Duration,
    scan_timeout: Duration,
}

impl fmt::Debug for OrphanSweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrphanSweeper")
            .field("backend_type", &type_name_of_val(self.backend.as_ref()))
            .field("orphan_timeout", &self.orphan_timeout)
            .field("scan_timeout", &self.scan_timeout)
            .finish()
    }
}

impl OrphanSweeper {
    pub fn new(backend: Arc<dyn BackendClient>, config: &OrchestratorConfig) -> Self {
        Self {
            backend,
            orphan_timeout: config.watcher.orphan_timeout(),
            scan_timeout: config.scanner.scan_timeout(),
        }
    }

    pub async fn sweep(&self, active: &ActiveScans) -> Result<Vec<FiredScan>> {
        self.sweep_at(active, Utc::now()).await
    }

    /// Settle every abandoned scan as of `now` and return the replacement
    /// runs this sweeper won.
    ///
    /// Scans in `active` belong to this process and are never touched.
    pub async fn sweep_at(
        &self,
        active: &ActiveScans,
        now: DateTime<Utc>,
    ) -> Result<Vec<FiredScan>> {
        let scans = self.backend.list_unfinished_scans().await?;
        let mut reruns = Vec::new();

        for scan in scans {
            if active.contains(&scan.id) || !self.is_orphaned(&scan, now) {
                continue;
            }
            let Some(disposition) = Disposition::of(&scan, now, self.scan_timeout)
            else {
                continue;
            };
            if let Some(fired) = self.settle(scan, disposition, now).await {
                reruns.push(fired);
            }
        }

        Ok(reruns)
    }

    fn is_orphaned(&self, scan: &Scan, now: DateTime<Utc>) -> bool {
        (now - scan.last_seen())
            .to_std()
            .is_ok_and(|idle| idle >= self.orphan_timeout)
    }

    async fn settle(
        &self,
        scan: Scan,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> Option<FiredScan> {
        let (reason, message) = match &disposition {
            Disposition::Rerun => (
                ScanStateReason::Unexpected,
                "Scan was abandoned before it started; a new run replaces it"
                    .to_string(),
            ),
            Disposition::Fail { reason, message } => (*reason, message.clone()),
        };

        tracing::warn!(
            target: "vmscan::recovery",
            scan_id = %scan.id,
            scan_config = %scan.config_snapshot.name,
            state = %scan.state,
            last_seen = %scan.last_seen(),
            reason = %reason,
            "Settling abandoned scan"
        );

        let patch = ScanPatch::state(ScanState::Failed, reason, message)
            .with_end_time(now);
        if let Err(err) = self.backend.patch_scan(scan.id, &patch).await {
            tracing::warn!(
                target: "vmscan::recovery",
                scan_id = %scan.id,
                error = %err,
                "Failed to settle abandoned scan"
            );
            return None;
        }

        if disposition != Disposition::Rerun {
            return None;
        }

        match self.backend.create_scan(&NewScan::rerun_of(&scan, now)).await {
            Ok(rerun) => {
                tracing::info!(
                    target: "vmscan::recovery",
                    scan_id = %rerun.id,
                    replaces = %scan.id,
                    "Replacement scan created"
                );
                Some(FiredScan {
                    scan: rerun,
                    origin: FireOrigin::Recovered { replaces: scan.id },
                })
            }
            Err(BackendError::ScanConflict { existing }) => {
                tracing::debug!(
                    target: "vmscan::recovery",
                    scan_id = %existing,
                    replaces = %scan.id,
                    "Another orchestrator already replaced the scan"
                );
                None
            }
            Err(err) => {
                tracing::warn!(
                    target: "vmscan::recovery",
                    replaces = %scan.id,
                    error = %err,
                    "Failed to create replacement scan"
                );
                None
            }
        }
    }
}
