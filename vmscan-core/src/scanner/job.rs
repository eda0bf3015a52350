//! Provisioning state machine for a single target.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;
use vmscan_model::{
    NewScanResult, ScanId, ScanResultId, ScanResultState, ScanResultStatus,
    TargetId, TargetInstance,
};

use crate::backend::BackendClient;
use crate::config::{PlacementConfig, ScannerConfig};
use crate::error::{CoreError, Result};
use crate::provider::retry::{RetryPolicy, retry};
use crate::provider::{ProviderClient, ScanJobConfig};

use super::cleanup;
use super::state::{JobStage, TargetStates};

/// How a target scan ended, as seen by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct TargetVerdict {
    pub(crate) success: bool,
    /// The scanner never reported within the result timeout.
    pub(crate) timed_out: bool,
}

/// Everything a worker needs to drive the targets of one scan.
pub(crate) struct ScanJob {
    pub(crate) scan_id: ScanId,
    pub(crate) backend: Arc<dyn BackendClient>,
    pub(crate) provider: Arc<dyn ProviderClient>,
    pub(crate) config: ScannerConfig,
    pub(crate) placement: PlacementConfig,
    pub(crate) scanner_cli_config: String,
    pub(crate) states: Arc<TargetStates>,
}

impl ScanJob {
    /// Drive one target to a verdict and clean up after it.
    pub(crate) async fn run_target(
        &self,
        target_id: TargetId,
        cancel: &CancellationToken,
    ) -> TargetVerdict {
        let Some(state) = self.states.get(&target_id) else {
            tracing::warn!(
                target: "vmscan::job",
                scan_id = %self.scan_id,
                target_id = %target_id,
                "Target is not part of this scan"
            );
            return TargetVerdict::default();
        };
        let target = state.target;
        let location = target.instance.location();

        tracing::info!(
            target: "vmscan::job",
            scan_id = %self.scan_id,
            target_instance = %location,
            "Starting target scan"
        );

        match self.drive(&target, cancel).await {
            Ok(None) => {
                self.states.complete(&target_id, true, false, None);
                tracing::info!(
                    target: "vmscan::job",
                    scan_id = %self.scan_id,
                    target_instance = %location,
                    "Target scan succeeded"
                );
            }
            Ok(Some(errors)) => {
                tracing::warn!(
                    target: "vmscan::job",
                    scan_id = %self.scan_id,
                    target_instance = %location,
                    errors = %errors,
                    "Scanner reported errors"
                );
                self.states.complete(&target_id, false, false, Some(errors));
            }
            Err(err) if err.is_cancelled() => {
                tracing::info!(
                    target: "vmscan::job",
                    scan_id = %self.scan_id,
                    target_instance = %location,
                    "Target scan cancelled"
                );
                self.states.interrupt(&target_id, err.to_string());
                self.report_status(
                    &target_id,
                    ScanResultStatus::new(ScanResultState::Aborted, Utc::now()),
                )
                .await;
            }
            Err(err) => {
                let message = err.to_string();
                let timed_out = matches!(err, CoreError::ResultTimeout(_));
                tracing::warn!(
                    target: "vmscan::job",
                    scan_id = %self.scan_id,
                    target_instance = %location,
                    timed_out,
                    error = %message,
                    "Target scan failed"
                );
                self.report_status(
                    &target_id,
                    ScanResultStatus::new(ScanResultState::Done, Utc::now())
                        .with_error(message.clone()),
                )
                .await;
                self.states
                    .complete(&target_id, false, timed_out, Some(message));
            }
        }

        self.cleanup(&target_id).await;
        self.states.advance(&target_id, JobStage::Finished);

        self.states
            .get(&target_id)
            .map(|state| TargetVerdict {
                success: state.completed && state.success,
                timed_out: state.timed_out,
            })
            .unwrap_or_default()
    }

    /// Returns the errors the scanner reported, if any.
    async fn drive(
        &self,
        target: &TargetInstance,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled("target scan".into()));
        }

        let id = &target.target_id;
        let result_id = self
            .backend
            .create_scan_result(&NewScanResult::init(
                self.scan_id,
                *id,
                Utc::now(),
            ))
            .await?;
        self.states.set_scan_result(id, result_id);

        self.provision(target, result_id, cancel).await?;

        self.backend
            .patch_scan_result_status(
                result_id,
                &ScanResultStatus::new(ScanResultState::Attached, Utc::now()),
            )
            .await?;

        self.await_result(id, result_id, cancel).await
    }

    async fn provision(
        &self,
        target: &TargetInstance,
        result_id: ScanResultId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = &target.target_id;
        let provider = self.provider.as_ref();
        let interval = self.config.readiness_interval();
        let call = RetryPolicy::new(self.config.provider_call_timeout(), interval);
        let wait = |timeout: Duration| RetryPolicy::new(timeout, interval);

        let root = retry(call, cancel, || {
            provider.get_instance_root_volume(&target.instance)
        })
        .await
        .map_err(|e| CoreError::from_wait("root volume lookup", e))?;
        self.states.advance(id, JobStage::RootVolumeResolved);

        let snapshot = retry(call, cancel, || provider.create_snapshot(&root))
            .await
            .map_err(|e| CoreError::from_wait("snapshot creation", e))?;
        self.states
            .record(id, |r| r.src_snapshot = Some(snapshot.clone()));
        self.states.advance(id, JobStage::SnapshotTaken);

        provider
            .wait_for_snapshot_ready(
                &snapshot,
                wait(self.config.snapshot_ready_timeout()),
                cancel,
            )
            .await
            .map_err(|e| CoreError::from_wait("snapshot", e))?;
        self.states.advance(id, JobStage::SnapshotReady);

        let region = self.placement.region.as_str();
        let scan_snapshot = if snapshot.region == region {
            snapshot
        } else {
            let copy = retry(call, cancel, || {
                provider.copy_snapshot(&snapshot, region)
            })
            .await
            .map_err(|e| CoreError::from_wait("snapshot copy", e))?;
            self.states
                .record(id, |r| r.dst_snapshot = Some(copy.clone()));
            self.states.advance(id, JobStage::SnapshotCopied);

            provider
                .wait_for_snapshot_ready(
                    &copy,
                    wait(self.config.snapshot_copy_timeout()),
                    cancel,
                )
                .await
                .map_err(|e| CoreError::from_wait("snapshot copy", e))?;
            self.states.advance(id, JobStage::CopyReady);
            copy
        };

        let job = ScanJobConfig {
            scan_id: self.scan_id,
            target_id: *id,
            scan_result_id: result_id,
            target: target.instance.clone(),
            scanner_image: self.placement.scanner_image.clone(),
            instance_type: self.placement.instance_type.clone(),
            region: self.placement.region.clone(),
            availability_zone: self.placement.availability_zone.clone(),
            block_device_name: self.placement.block_device_name.clone(),
            backend_address: self.placement.scanner_backend_address.clone(),
            scanner_cli_config: self.scanner_cli_config.clone(),
        };
        let instance = retry(call, cancel, || provider.launch_instance(&job))
            .await
            .map_err(|e| CoreError::from_wait("scanner launch", e))?;
        self.states
            .record(id, |r| r.instance = Some(instance.clone()));
        self.states.advance(id, JobStage::ScannerLaunched);

        let volume = retry(call, cancel, || {
            provider.create_volume(&scan_snapshot, &instance.availability_zone)
        })
        .await
        .map_err(|e| CoreError::from_wait("volume creation", e))?;
        self.states.record(id, |r| r.volume = Some(volume.clone()));
        self.states.advance(id, JobStage::VolumeFromSnapshotCreated);

        provider
            .wait_for_volume_ready(
                &volume,
                wait(self.config.volume_ready_timeout()),
                cancel,
            )
            .await
            .map_err(|e| CoreError::from_wait("volume", e))?;
        self.states.advance(id, JobStage::VolumeReady);

        provider
            .wait_for_instance_ready(
                &instance,
                wait(self.config.instance_ready_timeout()),
                cancel,
            )
            .await
            .map_err(|e| CoreError::from_wait("scanner instance", e))?;
        self.states.advance(id, JobStage::InstanceReady);

        let device = self.placement.block_device_name.as_str();
        retry(call, cancel, || {
            provider.attach_volume(&instance, &volume, device)
        })
        .await
        .map_err(|e| CoreError::from_wait("volume attachment", e))?;
        self.states.advance(id, JobStage::VolumeAttached);

        provider
            .wait_for_volume_attached(
                &instance,
                &volume,
                wait(self.config.volume_attach_timeout()),
                cancel,
            )
            .await
            .map_err(|e| CoreError::from_wait("volume attachment", e))?;
        self.states.advance(id, JobStage::AttachedConfirmed);

        Ok(())
    }

    async fn await_result(
        &self,
        id: &TargetId,
        result_id: ScanResultId,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let timeout = self.config.result_timeout();
        let deadline = Instant::now() + timeout;
        let mut ticker =
            tokio::time::interval(self.config.result_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(CoreError::Cancelled("scan result".into()));
                }
                _ = sleep_until(deadline) => {
                    return Err(CoreError::ResultTimeout(timeout));
                }
                _ = ticker.tick() => {}
            }

            let status = match self.backend.get_scan_result_status(result_id).await
            {
                Ok(status) => status,
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        target: "vmscan::job",
                        scan_result_id = %result_id,
                        error = %err,
                        "Failed to read scan result status, retrying"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match status.state {
                Some(state) if state.is_final() => {
                    self.states.advance(id, JobStage::ResultReceived);
                    let errors = status
                        .has_errors()
                        .then(|| status.errors.join("; "));
                    return Ok(errors);
                }
                Some(ScanResultState::Aborted) => {
                    tracing::debug!(
                        target: "vmscan::job",
                        scan_result_id = %result_id,
                        "Scanner aborted, waiting for its final result"
                    );
                }
                Some(_) => {}
                None => {
                    return Err(CoreError::InvalidState(format!(
                        "scan result {result_id} has no state"
                    )));
                }
            }
        }
    }

    /// Best-effort status report; the target verdict does not depend on it.
    async fn report_status(&self, id: &TargetId, status: ScanResultStatus) {
        let Some(result_id) =
            self.states.get(id).and_then(|state| state.scan_result_id)
        else {
            return;
        };
        if let Err(err) =
            self.backend.patch_scan_result_status(result_id, &status).await
        {
            tracing::warn!(
                target: "vmscan::job",
                scan_result_id = %result_id,
                error = %err,
                "Failed to update scan result status"
            );
        }
    }

    async fn cleanup(&self, id: &TargetId) {
        let Some(state) = self.states.get(id) else {
            return;
        };
        if state.resources.is_empty() {
            return;
        }

        let policy = self.config.delete_job_policy;
        if !cleanup::should_clean(policy, &state) {
            tracing::info!(
                target: "vmscan::job",
                scan_id = %self.scan_id,
                target_instance = %state.target.instance.location(),
                policy = %policy,
                success = state.success,
                "Retaining scan resources"
            );
            return;
        }

        let report = cleanup::delete_resources(
            self.provider.as_ref(),
            &state.target,
            &state.resources,
        )
        .await;
        tracing::debug!(
            target: "vmscan::job",
            scan_id = %self.scan_id,
            deleted = report.deleted,
            failed = report.failed,
            "Cleanup finished"
        );
    }
}
