use std::any::type_name_of_val;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use vmscan_model::{NewScan, Scan, ScanConfig, ScanId};

use crate::backend::{BackendClient, BackendError, ScanConfigQuery};
use crate::config::WatcherConfig;
use crate::error::{CoreError, Result};
use crate::schedule::{ScanConfigSchedule, ScheduleState};

/// Why a pending scan was handed to the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOrigin {
    /// Its configuration came due.
    Schedule,
    /// It replaces a pending scan that was abandoned before it started.
    Recovered { replaces: ScanId },
}

/// A pending scan ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredScan {
    pub scan: Scan,
    pub origin: FireOrigin,
}

impl FiredScan {
    pub fn scheduled(scan: Scan) -> Self {
        Self {
            scan,
            origin: FireOrigin::Schedule,
        }
    }
}

/// Polls enabled scan configurations and fires the ones that are due.
pub struct ScanConfigWatcher {
    backend: Arc<dyn BackendClient>,
    config: WatcherConfig,
}

impl fmt::Debug for ScanConfigWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanConfigWatcher")
            .field("backend_type", &type_name_of_val(self.backend.as_ref()))
            .field("config", &self.config)
            .finish()
    }
}

impl ScanConfigWatcher {
    pub fn new(backend: Arc<dyn BackendClient>, config: WatcherConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub async fn poll(&self) -> Result<Vec<FiredScan>> {
        self.poll_at(Utc::now()).await
    }

    /// Run one reconciliation cycle as of `now`.
    ///
    /// Listing failures abort the cycle. Failures that concern a single
    /// configuration are logged and only skip that configuration.
    pub async fn poll_at(&self, now: DateTime<Utc>) -> Result<Vec<FiredScan>> {
        let window = TimeDelta::from_std(self.config.schedule_window())
            .map_err(|_| {
                CoreError::Config("schedule window is out of range".into())
            })?;

        let configs = self.fetch_enabled_configs().await?;
        let mut fired = Vec::new();

        for config in configs {
            let schedule =
                match ScanConfigSchedule::evaluate(&config, now, window) {
                    Ok(schedule) => schedule,
                    Err(err) => {
                        tracing::warn!(
                            target: "vmscan::watcher",
                            config = %config.id,
                            name = %config.name,
                            error = %err,
                            "failed to evaluate scan configuration schedule"
                        );
                        continue;
                    }
                };

            tracing::debug!(
                target: "vmscan::watcher",
                config = %config.id,
                state = %schedule.state,
                window = %schedule.window,
                "evaluated schedule"
            );

            match schedule.state {
                ScheduleState::Due => {
                    if let Some(scan) = self.fire(config, &schedule, now).await {
                        fired.push(scan);
                    }
                }
                ScheduleState::Overdue => {
                    self.fast_forward(&config, &schedule, now).await;
                }
                ScheduleState::Disabled
                | ScheduleState::Unscheduled
                | ScheduleState::NotDue => {}
            }
        }

        Ok(fired)
    }

    /// Poll every `poll_interval` until `shutdown` fires or the receiving
    /// side goes away.
    pub async fn run(
        &self,
        sender: mpsc::Sender<FiredScan>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let cycle =
                tokio::time::timeout(self.config.reconcile_timeout(), self.poll());
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                outcome = cycle => outcome,
            };

            let fired = match outcome {
                Ok(Ok(fired)) => fired,
                Ok(Err(err)) => {
                    tracing::warn!(
                        target: "vmscan::watcher",
                        error = %err,
                        "scan configuration poll failed"
                    );
                    continue;
                }
                Err(_) => {
                    tracing::warn!(
                        target: "vmscan::watcher",
                        timeout = ?self.config.reconcile_timeout(),
                        "scan configuration poll timed out"
                    );
                    continue;
                }
            };

            for scan in fired {
                if sender.send(scan).await.is_err() {
                    tracing::info!(
                        target: "vmscan::watcher",
                        "fired scan receiver closed; stopping watcher"
                    );
                    return;
                }
            }
        }

        tracing::debug!(target: "vmscan::watcher", "watcher stopped");
    }

    async fn fetch_enabled_configs(&self) -> Result<Vec<ScanConfig>> {
        let page_size = self.config.page_size.max(1);
        let mut page = 1u32;
        let mut configs = Vec::new();

        loop {
            let listing = self
                .backend
                .list_scan_configs(ScanConfigQuery::enabled(page, page_size))
                .await?;
            let fetched = listing.items.len();
            configs.extend(listing.items);

            if fetched == 0
                || u64::from(page) * u64::from(page_size) >= listing.count
            {
                break;
            }
            page += 1;
        }

        Ok(configs)
    }

    async fn fire(
        &self,
        config: ScanConfig,
        schedule: &ScanConfigSchedule,
        now: DateTime<Utc>,
    ) -> Option<FiredScan> {
        match self.backend.list_active_scans(config.id).await {
            Ok(active) if !active.is_empty() => {
                tracing::debug!(
                    target: "vmscan::watcher",
                    config = %config.id,
                    active = active.len(),
                    "scan already running for configuration; not firing"
                );
                return None;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    target: "vmscan::watcher",
                    config = %config.id,
                    error = %err,
                    "failed to check for running scans"
                );
                return None;
            }
        }

        let scan = match self
            .backend
            .create_scan(&NewScan::pending(&config, now))
            .await
        {
            Ok(scan) => scan,
            Err(BackendError::ScanConflict { existing }) => {
                tracing::info!(
                    target: "vmscan::watcher",
                    config = %config.id,
                    scan = %existing,
                    "another scan won the race for this configuration"
                );
                return None;
            }
            Err(err) => {
                tracing::warn!(
                    target: "vmscan::watcher",
                    config = %config.id,
                    error = %err,
                    "failed to create scan"
                );
                return None;
            }
        };

        if let Some(patch) = schedule.after_fire_patch()
            && let Err(err) =
                self.backend.patch_scan_config(config.id, &patch).await
        {
            tracing::warn!(
                target: "vmscan::watcher",
                config = %config.id,
                error = %err,
                "failed to advance schedule after firing"
            );
        }

        tracing::info!(
            target: "vmscan::watcher",
            config = %config.id,
            name = %config.name,
            scan = %scan.id,
            "scan configuration fired"
        );

        Some(FiredScan::scheduled(scan))
    }

    async fn fast_forward(
        &self,
        config: &ScanConfig,
        schedule: &ScanConfigSchedule,
        now: DateTime<Utc>,
    ) {
        let Some(patch) = schedule.fast_forward_patch(now) else {
            return;
        };

        tracing::info!(
            target: "vmscan::watcher",
            config = %config.id,
            next = ?patch.scheduled.as_ref().and_then(|s| s.operation_time),
            "schedule overdue; skipping missed occurrences"
        );

        if let Err(err) = self.backend.patch_scan_config(config.id, &patch).await {
            tracing::warn!(
                target: "vmscan::watcher",
                config = %config.id,
                error = %err,
                "failed to fast-forward overdue schedule"
            );
        }
    }
}
