//! Scan execution: discovery, the per-target worker pool and aggregation of
//! target verdicts into the final scan state.

pub mod bundle;
pub mod cleanup;
mod job;
pub mod state;

use std::any::type_name_of_val;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use vmscan_model::{
    InstanceInfo, ScanId, ScanPatch, ScanState, ScanStateReason, TargetId,
    TargetInstance,
};

use crate::backend::{BackendClient, BackendError};
use crate::config::{
    OrchestratorConfig, PlacementConfig, ScannerConfig, ScannerToolsConfig,
};
use crate::error::{CoreError, Result};
use crate::provider::retry::{RetryPolicy, WaitError, retry};
use crate::provider::ProviderClient;
use crate::watcher::FiredScan;

pub use bundle::ScannerCliConfig;
pub use cleanup::{CleanupReport, delete_resources, should_clean};
pub use state::{JobResources, JobStage, PerTargetScanState, TargetStates};

use job::{ScanJob, TargetVerdict};

/// Final state of a scan as written to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub scan_id: ScanId,
    pub state: ScanState,
    pub reason: ScanStateReason,
    pub message: String,
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Failed targets whose scanner never reported in time.
    pub timed_out: u32,
}

/// Runs fired scans to completion.
pub struct Scanner {
    backend: Arc<dyn BackendClient>,
    provider: Arc<dyn ProviderClient>,
    config: ScannerConfig,
    placement: PlacementConfig,
    tools: ScannerToolsConfig,
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("backend_type", &type_name_of_val(self.backend.as_ref()))
            .field("provider", &self.provider.kind())
            .field("config", &self.config)
            .field("placement", &self.placement)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct TargetCompletion {
    target_id: TargetId,
    verdict: TargetVerdict,
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    total: u32,
    completed: u32,
    failed: u32,
    timed_out: u32,
}

impl Tally {
    fn new(total: u32) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    fn record(&mut self, verdict: TargetVerdict) {
        self.completed += 1;
        if !verdict.success {
            self.failed += 1;
        }
        if verdict.timed_out {
            self.timed_out += 1;
        }
    }

    fn succeeded(&self) -> u32 {
        self.completed - self.failed
    }

    fn left(&self) -> u32 {
        self.total.saturating_sub(self.completed)
    }

    fn is_complete(&self) -> bool {
        self.completed >= self.total
    }

    fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed out of {} total target scans",
            self.succeeded(),
            self.failed,
            self.total
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Ending {
    Completed,
    NothingToScan,
    DiscoveryFailed(String),
    Aborted,
    TimedOut(Duration),
    Unexpected(String),
}

impl Ending {
    fn resolve(self, tally: &Tally) -> (ScanState, ScanStateReason, String) {
        match self {
            Ending::Completed if tally.failed > 0 => (
                ScanState::Failed,
                ScanStateReason::OneOrMoreTargetFailedToScan,
                tally.summary(),
            ),
            Ending::Completed => {
                (ScanState::Done, ScanStateReason::Success, tally.summary())
            }
            Ending::NothingToScan => (
                ScanState::Done,
                ScanStateReason::NothingToScan,
                "No instances found in scope".to_string(),
            ),
            Ending::DiscoveryFailed(err) => (
                ScanState::Failed,
                ScanStateReason::DiscoveryFailed,
                format!("Failed to discover instances: {err}"),
            ),
            Ending::Aborted => (
                ScanState::Failed,
                ScanStateReason::Aborted,
                "Scan has been aborted".to_string(),
            ),
            Ending::TimedOut(after) => (
                ScanState::Failed,
                ScanStateReason::TimedOut,
                format!("Scan timed out after {}s", after.as_secs()),
            ),
            Ending::Unexpected(message) => {
                (ScanState::Failed, ScanStateReason::Unexpected, message)
            }
        }
    }
}

impl Scanner {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        provider: Arc<dyn ProviderClient>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            backend,
            provider,
            config: config.scanner.clone(),
            placement: config.placement.clone(),
            tools: config.tools.clone(),
        }
    }

    /// Execute a fired scan and write its terminal state.
    ///
    /// `cancel` is the per-scan token; cancelling it aborts the scan. The
    /// terminal state is written as soon as the outcome is known, and every
    /// worker is drained before this returns.
    pub async fn run_scan(
        &self,
        fired: FiredScan,
        cancel: CancellationToken,
    ) -> Result<ScanOutcome> {
        let scan = fired.scan;
        let scan_id = scan.id;
        let snapshot = scan.config_snapshot;

        tracing::info!(
            target: "vmscan::scanner",
            scan_id = %scan_id,
            scan_config = %snapshot.name,
            "Starting scan"
        );

        let policy = RetryPolicy::new(
            self.config.discovery_timeout(),
            self.config.readiness_interval(),
        );
        let provider = self.provider.as_ref();
        let instances =
            match retry(policy, &cancel, || provider.discover(&snapshot.scope))
                .await
            {
                Ok(instances) => instances,
                Err(WaitError::Cancelled) => {
                    return self.finish(scan_id, Tally::new(0), Ending::Aborted).await;
                }
                Err(err) => {
                    return self
                        .finish(
                            scan_id,
                            Tally::new(0),
                            Ending::DiscoveryFailed(err.to_string()),
                        )
                        .await;
                }
            };

        let targets = match self.register_targets(instances).await {
            Ok(targets) => targets,
            Err(err) => {
                return self
                    .finish(
                        scan_id,
                        Tally::new(0),
                        Ending::Unexpected(format!(
                            "Failed to register targets: {err}"
                        )),
                    )
                    .await;
            }
        };
        if targets.is_empty() {
            return self
                .finish(scan_id, Tally::new(0), Ending::NothingToScan)
                .await;
        }

        let total = u32::try_from(targets.len()).unwrap_or(u32::MAX);
        self.backend
            .patch_scan(
                scan_id,
                &ScanPatch::state(
                    ScanState::Discovered,
                    ScanStateReason::Discovered,
                    format!("{total} targets discovered"),
                )
                .with_targets(targets.iter().map(|t| t.target_id).collect())
                .with_jobs(0, total),
            )
            .await?;

        let scanner_cli_config = ScannerCliConfig::new(&snapshot.families, &self.tools)
            .to_json()
            .map_err(|e| {
                CoreError::InvalidState(format!("scanner config bundle: {e}"))
            })?;

        let (queue_tx, queue_rx) = mpsc::channel(targets.len());
        for target in &targets {
            queue_tx.send(target.target_id).await.map_err(|_| {
                CoreError::InvalidState("target queue closed".into())
            })?;
        }
        drop(queue_tx);
        let queue = Arc::new(Mutex::new(queue_rx));

        let job = Arc::new(ScanJob {
            scan_id,
            backend: Arc::clone(&self.backend),
            provider: Arc::clone(&self.provider),
            config: self.config.clone(),
            placement: self.placement.clone(),
            scanner_cli_config,
            states: Arc::new(TargetStates::new(targets)),
        });

        let workers = snapshot
            .max_parallel_scanners
            .unwrap_or(self.config.max_parallel_scanners)
            .max(1);
        let worker_cancel = cancel.child_token();
        let (done_tx, mut done_rx) = mpsc::channel(total as usize);
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                tokio::spawn(work(
                    worker,
                    Arc::clone(&job),
                    Arc::clone(&queue),
                    done_tx.clone(),
                    worker_cancel.clone(),
                ))
            })
            .collect();
        drop(done_tx);

        tracing::info!(
            target: "vmscan::scanner",
            scan_id = %scan_id,
            targets = total,
            workers,
            "Target scans dispatched"
        );

        if let Err(err) = self
            .backend
            .patch_scan(
                scan_id,
                &ScanPatch::state(
                    ScanState::InProgress,
                    ScanStateReason::TargetScansRunning,
                    format!("{total} target scans running"),
                ),
            )
            .await
        {
            tracing::warn!(
                target: "vmscan::scanner",
                scan_id = %scan_id,
                error = %err,
                "Failed to mark scan in progress"
            );
        }

        let timeout = snapshot
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.scan_timeout());
        let deadline = Instant::now() + timeout;
        let mut tally = Tally::new(total);

        let ending = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ending::Aborted,
                _ = sleep_until(deadline) => break Ending::TimedOut(timeout),
                completion = done_rx.recv() => {
                    let Some(completion) = completion else {
                        break Ending::Unexpected(format!(
                            "Workers exited after {} of {} target scans",
                            tally.completed, total
                        ));
                    };
                    tally.record(completion.verdict);
                    tracing::debug!(
                        target: "vmscan::scanner",
                        scan_id = %scan_id,
                        target_id = %completion.target_id,
                        success = completion.verdict.success,
                        timed_out = completion.verdict.timed_out,
                        completed = tally.completed,
                        total,
                        "Target scan completed"
                    );
                    if tally.is_complete() {
                        break Ending::Completed;
                    }
                    self.report_progress(scan_id, &tally).await;
                }
            }
        };

        // The verdict is written before outstanding workers are drained;
        // their cleanup can take as long as the provider needs.
        worker_cancel.cancel();
        let outcome = self.finish(scan_id, tally, ending).await;

        drop(done_rx);
        for joined in join_all(handles).await {
            if let Err(err) = joined {
                tracing::error!(
                    target: "vmscan::scanner",
                    scan_id = %scan_id,
                    error = %err,
                    "Scan worker panicked"
                );
            }
        }
        tracing::debug!(
            target: "vmscan::scanner",
            scan_id = %scan_id,
            "Scan workers drained"
        );

        outcome
    }

    async fn register_targets(
        &self,
        instances: Vec<InstanceInfo>,
    ) -> std::result::Result<Vec<TargetInstance>, BackendError> {
        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(instances.len());
        for instance in instances {
            if !seen.insert((instance.instance_id.clone(), instance.region.clone())) {
                continue;
            }
            let target = self.backend.create_or_get_target(&instance).await?;
            targets.push(TargetInstance {
                target_id: target.id,
                instance,
            });
        }
        Ok(targets)
    }

    async fn report_progress(&self, scan_id: ScanId, tally: &Tally) {
        let patch = ScanPatch::default().with_jobs(tally.completed, tally.left());
        if let Err(err) = self.backend.patch_scan(scan_id, &patch).await {
            tracing::warn!(
                target: "vmscan::scanner",
                scan_id = %scan_id,
                error = %err,
                "Failed to update scan progress"
            );
        }
    }

    async fn finish(
        &self,
        scan_id: ScanId,
        tally: Tally,
        ending: Ending,
    ) -> Result<ScanOutcome> {
        let (state, reason, message) = ending.resolve(&tally);
        self.backend
            .patch_scan(
                scan_id,
                &ScanPatch::state(state, reason, message.clone())
                    .with_end_time(Utc::now())
                    .with_jobs(tally.completed, tally.left()),
            )
            .await?;

        tracing::info!(
            target: "vmscan::scanner",
            scan_id = %scan_id,
            state = %state,
            reason = %reason,
            message = %message,
            "Scan finished"
        );

        Ok(ScanOutcome {
            scan_id,
            state,
            reason,
            message,
            total: tally.total,
            succeeded: tally.succeeded(),
            failed: tally.failed,
            timed_out: tally.timed_out,
        })
    }
}

async fn work(
    worker: u32,
    job: Arc<ScanJob>,
    queue: Arc<Mutex<mpsc::Receiver<TargetId>>>,
    done: mpsc::Sender<TargetCompletion>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = queue.recv() => next,
            }
        };
        let Some(target_id) = next else {
            break;
        };

        tracing::debug!(
            target: "vmscan::scanner",
            worker,
            target_id = %target_id,
            "Worker picked up target"
        );
        let verdict = job.run_target(target_id, &cancel).await;
        if done
            .send(TargetCompletion { target_id, verdict })
            .await
            .is_err()
        {
            break;
        }
    }
}
