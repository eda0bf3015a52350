use std::any::type_name_of_val;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use vmscan_model::{ScanId, ScanPatch, ScanState, ScanStateReason};

use crate::backend::BackendClient;
use crate::config::OrchestratorConfig;
use crate::error::{CoreError, Result};
use crate::provider::ProviderClient;
use crate::recovery::OrphanSweeper;
use crate::scanner::Scanner;
use crate::watcher::{FiredScan, ScanConfigWatcher};

const FIRED_SCAN_BUFFER: usize = 32;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Cancellation handles of the scans this process is currently running.
#[derive(Debug, Default)]
pub struct ActiveScans {
    inner: parking_lot::Mutex<HashMap<ScanId, CancellationToken>>,
}

impl ActiveScans {
    pub(crate) fn insert(&self, id: ScanId, token: CancellationToken) {
        self.inner.lock().insert(id, token);
    }

    pub(crate) fn remove(&self, id: &ScanId) {
        self.inner.lock().remove(id);
    }

    /// Cancel a running scan. Returns `false` when it is not running here.
    pub fn cancel(&self, id: &ScanId) -> bool {
        match self.inner.lock().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &ScanId) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<ScanId> {
        self.inner.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Top-level lifecycle: runs the watcher, hands fired scans to the scanner,
/// keeps heartbeats on running scans and settles abandoned ones.
pub struct Orchestrator {
    config: OrchestratorConfig,
    backend: Arc<dyn BackendClient>,
    watcher: Arc<ScanConfigWatcher>,
    scanner: Arc<Scanner>,
    active: Arc<ActiveScans>,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("backend_type", &type_name_of_val(self.backend.as_ref()))
            .field("scanner", &self.scanner)
            .field("active_scans", &self.active.len())
            .field("worker_handle_count", &worker_handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn BackendClient>,
        provider: Arc<dyn ProviderClient>,
    ) -> Self {
        let watcher = Arc::new(ScanConfigWatcher::new(
            Arc::clone(&backend),
            config.watcher.clone(),
        ));
        let scanner =
            Arc::new(Scanner::new(Arc::clone(&backend), provider, &config));

        Self {
            config,
            backend,
            watcher,
            scanner,
            active: Arc::new(ActiveScans::default()),
            shutdown_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn active_scans(&self) -> Arc<ActiveScans> {
        Arc::clone(&self.active)
    }

    /// Spawn the watcher, the orphan sweeper, the dispatcher and the
    /// supervisor of running scans.
    ///
    /// The watcher and the sweeper start after the configured startup delay
    /// so replicas started together do not fire in the same instant. The
    /// dispatcher starts right away and never leaves fired scans parked.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(CoreError::InvalidState(
                "orchestrator has already been stopped".into(),
            ));
        }

        let (fired_tx, fired_rx) = mpsc::channel(FIRED_SCAN_BUFFER);
        let startup_delay = self.config.controller_startup_delay();
        let poll_interval = self.config.watcher.poll_interval();
        let mut handles = self.worker_handles.lock().await;

        let watcher = Arc::clone(&self.watcher);
        let shutdown = self.shutdown_token.clone();
        let watcher_tx = fired_tx.clone();
        handles.push(tokio::spawn(async move {
            if staggered(startup_delay, &shutdown).await {
                watcher.run(watcher_tx, shutdown).await;
            }
        }));

        let sweeper = OrphanSweeper::new(Arc::clone(&self.backend), &self.config);
        let active = Arc::clone(&self.active);
        let shutdown = self.shutdown_token.clone();
        handles.push(tokio::spawn(async move {
            if staggered(startup_delay, &shutdown).await {
                recover_orphans(sweeper, active, fired_tx, poll_interval, shutdown)
                    .await;
            }
        }));

        handles.push(tokio::spawn(dispatch(
            fired_rx,
            Arc::clone(&self.scanner),
            Arc::clone(&self.backend),
            Arc::clone(&self.active),
            self.shutdown_token.clone(),
        )));

        handles.push(tokio::spawn(supervise_active_scans(
            Arc::clone(&self.backend),
            Arc::clone(&self.active),
            poll_interval,
            self.shutdown_token.clone(),
        )));

        tracing::info!(
            target: "vmscan::orchestrator",
            poll_interval = ?poll_interval,
            startup_delay = ?startup_delay,
            orphan_timeout = ?self.config.watcher.orphan_timeout(),
            "Orchestrator started"
        );
        Ok(())
    }

    /// Abort a scan running in this process.
    pub fn abort_scan(&self, id: &ScanId) -> bool {
        let found = self.active.cancel(id);
        if found {
            tracing::info!(
                target: "vmscan::orchestrator",
                scan_id = %id,
                "Scan abort requested"
            );
        }
        found
    }

    /// Cancel everything and wait for running scans to clean up.
    pub async fn stop(&self) -> Result<()> {
        tracing::info!(
            target: "vmscan::orchestrator",
            "Initiating graceful shutdown of orchestrator"
        );
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(
                    target: "vmscan::orchestrator",
                    error = %err,
                    "Orchestrator task failed"
                ),
                Err(_) => tracing::warn!(
                    target: "vmscan::orchestrator",
                    "Orchestrator task timed out during shutdown"
                ),
            }
        }

        tracing::info!(
            target: "vmscan::orchestrator",
            "Orchestrator shutdown complete"
        );
        Ok(())
    }
}

/// Wait out `delay`. Returns `false` when shutdown came first.
async fn staggered(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn dispatch(
    mut fired_rx: mpsc::Receiver<FiredScan>,
    scanner: Arc<Scanner>,
    backend: Arc<dyn BackendClient>,
    active: Arc<ActiveScans>,
    shutdown: CancellationToken,
) {
    let mut scans: Vec<JoinHandle<()>> = Vec::new();
    loop {
        let fired = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            fired = fired_rx.recv() => fired,
        };
        let Some(fired) = fired else {
            break;
        };

        let scan_id = fired.scan.id;
        let token = shutdown.child_token();
        active.insert(scan_id, token.clone());

        let scanner = Arc::clone(&scanner);
        let backend = Arc::clone(&backend);
        let active = Arc::clone(&active);
        scans.retain(|handle| !handle.is_finished());
        scans.push(tokio::spawn(async move {
            run_scan(scanner, backend, fired, token).await;
            active.remove(&scan_id);
        }));
    }

    // Scans fired but never picked up already exist in the backend and
    // would block their configuration until swept.
    fired_rx.close();
    while let Some(fired) = fired_rx.recv().await {
        abandon_queued(backend.as_ref(), &fired).await;
    }

    // Scan tokens are children of the shutdown token, so every scan is
    // already winding down here.
    for joined in join_all(scans).await {
        if let Err(err) = joined {
            tracing::error!(
                target: "vmscan::orchestrator",
                error = %err,
                "Scan task panicked"
            );
        }
    }
}

async fn abandon_queued(backend: &dyn BackendClient, fired: &FiredScan) {
    let scan_id = fired.scan.id;
    let patch = ScanPatch::state(
        ScanState::Failed,
        ScanStateReason::Aborted,
        "Orchestrator shut down before the scan started",
    )
    .with_end_time(Utc::now());

    match backend.patch_scan(scan_id, &patch).await {
        Ok(()) => tracing::info!(
            target: "vmscan::orchestrator",
            scan_id = %scan_id,
            origin = ?fired.origin,
            "Queued scan failed at shutdown"
        ),
        Err(err) => tracing::warn!(
            target: "vmscan::orchestrator",
            scan_id = %scan_id,
            error = %err,
            "Failed to fail queued scan at shutdown"
        ),
    }
}

async fn run_scan(
    scanner: Arc<Scanner>,
    backend: Arc<dyn BackendClient>,
    fired: FiredScan,
    token: CancellationToken,
) {
    let scan_id = fired.scan.id;
    match scanner.run_scan(fired, token).await {
        Ok(outcome) => tracing::info!(
            target: "vmscan::orchestrator",
            scan_id = %scan_id,
            state = %outcome.state,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            timed_out = outcome.timed_out,
            "Scan completed"
        ),
        Err(err) => {
            tracing::error!(
                target: "vmscan::orchestrator",
                scan_id = %scan_id,
                error = %err,
                "Scan ended with an error"
            );
            let patch = ScanPatch::state(
                ScanState::Failed,
                ScanStateReason::Unexpected,
                err.to_string(),
            )
            .with_end_time(Utc::now());
            if let Err(err) = backend.patch_scan(scan_id, &patch).await {
                tracing::warn!(
                    target: "vmscan::orchestrator",
                    scan_id = %scan_id,
                    error = %err,
                    "Failed to record scan failure"
                );
            }
        }
    }
}

/// Mark every local scan with a heartbeat and cancel the ones whose backend
/// record was flipped to `Aborted`.
async fn supervise_active_scans(
    backend: Arc<dyn BackendClient>,
    active: Arc<ActiveScans>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for scan_id in active.ids() {
            match backend.get_scan(scan_id).await {
                Ok(scan) if scan.state == ScanState::Aborted => {
                    if active.cancel(&scan_id) {
                        tracing::info!(
                            target: "vmscan::orchestrator",
                            scan_id = %scan_id,
                            "Scan aborted by operator"
                        );
                    }
                    continue;
                }
                Ok(scan) if scan.state.is_terminal() => continue,
                Ok(_) => {}
                Err(err) => tracing::debug!(
                    target: "vmscan::orchestrator",
                    scan_id = %scan_id,
                    error = %err,
                    "Failed to check scan for abort"
                ),
            }

            if let Err(err) = backend
                .patch_scan(scan_id, &ScanPatch::heartbeat(Utc::now()))
                .await
            {
                tracing::debug!(
                    target: "vmscan::orchestrator",
                    scan_id = %scan_id,
                    error = %err,
                    "Failed to record scan heartbeat"
                );
            }
        }
    }
}

/// Settle abandoned scans once per poll interval and hand replacement runs
/// to the dispatcher.
async fn recover_orphans(
    sweeper: OrphanSweeper,
    active: Arc<ActiveScans>,
    fired_tx: mpsc::Sender<FiredScan>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let reruns = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            swept = sweeper.sweep(&active) => swept,
        };
        match reruns {
            Ok(reruns) => {
                for fired in reruns {
                    if fired_tx.send(fired).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => tracing::warn!(
                target: "vmscan::orchestrator",
                error = %err,
                "Failed to sweep abandoned scans"
            ),
        }
    }
}
