//! In-memory fakes shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use vmscan_core::backend::{BackendClient, BackendError, ScanConfigQuery};
use vmscan_core::config::OrchestratorConfig;
use vmscan_core::provider::{
    Instance, ProviderClient, ProviderError, ProviderKind, ProviderResult,
    ScanJobConfig, Snapshot, Volume,
};
use vmscan_model::{
    InstanceInfo, NewScan, NewScanResult, Page, Scan, ScanConfig,
    ScanConfigId, ScanConfigPatch, ScanId, ScanPatch, ScanResult,
    ScanResultId, ScanResultState, ScanResultStatus, ScanScope, Target,
    TargetId,
};

/// How the simulated scanner answers once its volume is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScannerBehaviour {
    /// Report `Done` without errors immediately.
    #[default]
    Succeed,
    /// Never report.
    Silent,
}

/// Backend store that behaves like the real API for the calls the engine
/// makes, including the conflict guard on scan creation.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    configs: Mutex<Vec<ScanConfig>>,
    scans: Mutex<HashMap<ScanId, Scan>>,
    scan_patches: Mutex<Vec<(ScanId, ScanPatch)>>,
    targets: Mutex<HashMap<(String, String), Target>>,
    results: Mutex<HashMap<ScanResultId, ScanResult>>,
    scanner: Mutex<ScannerBehaviour>,
    /// Instance ids whose scanner reports an error.
    scanner_errors: Mutex<HashSet<String>>,
    /// Instance ids whose scanner reports a status without a state.
    blank_reports: Mutex<HashSet<String>>,
}

impl InMemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_config(&self, config: ScanConfig) {
        self.configs.lock().push(config);
    }

    pub fn config(&self, id: ScanConfigId) -> Option<ScanConfig> {
        self.configs.lock().iter().find(|c| c.id == id).cloned()
    }

    pub fn set_scanner(&self, behaviour: ScannerBehaviour) {
        *self.scanner.lock() = behaviour;
    }

    pub fn fail_scanner_for(&self, instance_id: &str) {
        self.scanner_errors.lock().insert(instance_id.to_string());
    }

    pub fn report_without_state_for(&self, instance_id: &str) {
        self.blank_reports.lock().insert(instance_id.to_string());
    }

    pub fn insert_scan(&self, new: NewScan) -> Scan {
        let scan = Scan::from_new(ScanId::new(), new);
        self.scans.lock().insert(scan.id, scan.clone());
        scan
    }

    pub fn scan(&self, id: ScanId) -> Option<Scan> {
        self.scans.lock().get(&id).cloned()
    }

    pub fn scans_for(&self, config: ScanConfigId) -> Vec<Scan> {
        self.scans
            .lock()
            .values()
            .filter(|scan| scan.scan_config_id == config)
            .cloned()
            .collect()
    }

    pub fn scan_patches(&self, id: ScanId) -> Vec<ScanPatch> {
        self.scan_patches
            .lock()
            .iter()
            .filter(|(scan, _)| *scan == id)
            .map(|(_, patch)| patch.clone())
            .collect()
    }

    pub fn results(&self) -> Vec<ScanResult> {
        self.results.lock().values().cloned().collect()
    }

    fn instance_of(&self, target: TargetId) -> Option<String> {
        self.targets
            .lock()
            .values()
            .find(|t| t.id == target)
            .map(|t| t.instance.instance_id.clone())
    }
}

#[async_trait]
impl BackendClient for InMemoryBackend {
    async fn list_scan_configs(
        &self,
        query: ScanConfigQuery,
    ) -> Result<Page<ScanConfig>, BackendError> {
        let matching: Vec<_> = self
            .configs
            .lock()
            .iter()
            .filter(|c| !query.enabled_only || !c.disabled)
            .cloned()
            .collect();
        let size = query.page_size.max(1) as usize;
        let skip = (query.page.max(1) as usize - 1) * size;
        let items = matching.iter().skip(skip).take(size).cloned().collect();
        Ok(Page::new(matching.len() as u64, items))
    }

    async fn patch_scan_config(
        &self,
        id: ScanConfigId,
        patch: &ScanConfigPatch,
    ) -> Result<(), BackendError> {
        let mut configs = self.configs.lock();
        let config = configs.iter_mut().find(|c| c.id == id).ok_or_else(|| {
            BackendError::NotFound {
                kind: "scanConfig",
                id: id.to_string(),
            }
        })?;
        if let Some(schedule) = &patch.scheduled {
            config.scheduled = Some(schedule.clone());
        }
        if let Some(disabled) = patch.disabled {
            config.disabled = disabled;
        }
        Ok(())
    }

    async fn list_active_scans(
        &self,
        config_id: ScanConfigId,
    ) -> Result<Vec<Scan>, BackendError> {
        Ok(self
            .scans_for(config_id)
            .into_iter()
            .filter(|scan| !scan.state.is_terminal())
            .collect())
    }

    async fn list_unfinished_scans(&self) -> Result<Vec<Scan>, BackendError> {
        Ok(self
            .scans
            .lock()
            .values()
            .filter(|scan| !scan.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn get_scan(&self, id: ScanId) -> Result<Scan, BackendError> {
        self.scan(id).ok_or_else(|| BackendError::NotFound {
            kind: "scan",
            id: id.to_string(),
        })
    }

    async fn create_scan(&self, new: &NewScan) -> Result<Scan, BackendError> {
        let mut scans = self.scans.lock();
        if let Some(existing) = scans.values().find(|scan| {
            scan.scan_config_id == new.scan_config_id
                && !scan.state.is_terminal()
        }) {
            return Err(BackendError::ScanConflict {
                existing: existing.id,
            });
        }
        let scan = Scan::from_new(ScanId::new(), new.clone());
        scans.insert(scan.id, scan.clone());
        Ok(scan)
    }

    async fn patch_scan(
        &self,
        id: ScanId,
        patch: &ScanPatch,
    ) -> Result<(), BackendError> {
        let mut scans = self.scans.lock();
        let scan = scans.get_mut(&id).ok_or_else(|| BackendError::NotFound {
            kind: "scan",
            id: id.to_string(),
        })?;
        scan.apply(patch);
        self.scan_patches.lock().push((id, patch.clone()));
        Ok(())
    }

    async fn create_or_get_target(
        &self,
        instance: &InstanceInfo,
    ) -> Result<Target, BackendError> {
        let key = (instance.instance_id.clone(), instance.region.clone());
        Ok(self
            .targets
            .lock()
            .entry(key)
            .or_insert_with(|| Target {
                id: TargetId::new(),
                instance: instance.clone(),
            })
            .clone())
    }

    async fn create_scan_result(
        &self,
        result: &NewScanResult,
    ) -> Result<ScanResultId, BackendError> {
        let mut results = self.results.lock();
        if let Some(existing) = results.values().find(|r| {
            r.scan_id == result.scan_id && r.target_id == result.target_id
        }) {
            return Ok(existing.id);
        }
        let id = ScanResultId::new();
        results.insert(
            id,
            ScanResult {
                id,
                scan_id: result.scan_id,
                target_id: result.target_id,
                status: result.status.clone(),
            },
        );
        Ok(id)
    }

    async fn get_scan_result_status(
        &self,
        id: ScanResultId,
    ) -> Result<ScanResultStatus, BackendError> {
        self.results
            .lock()
            .get(&id)
            .map(|r| r.status.clone())
            .ok_or_else(|| BackendError::NotFound {
                kind: "scanResult",
                id: id.to_string(),
            })
    }

    async fn patch_scan_result_status(
        &self,
        id: ScanResultId,
        status: &ScanResultStatus,
    ) -> Result<(), BackendError> {
        let target = {
            let mut results = self.results.lock();
            let result =
                results.get_mut(&id).ok_or_else(|| BackendError::NotFound {
                    kind: "scanResult",
                    id: id.to_string(),
                })?;
            result.status = status.clone();
            result.target_id
        };

        let attached = status.state == Some(ScanResultState::Attached);
        if attached && *self.scanner.lock() == ScannerBehaviour::Succeed {
            let mut report = ScanResultStatus::new(ScanResultState::Done, Utc::now());
            if let Some(instance) = self.instance_of(target) {
                if self.scanner_errors.lock().contains(&instance) {
                    report = report.with_error("scanner crashed");
                }
                if self.blank_reports.lock().contains(&instance) {
                    report.state = None;
                }
            }
            if let Some(result) = self.results.lock().get_mut(&id) {
                result.status = report;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Snapshot(String),
    Volume(String),
    Instance(String),
}

/// Provider that provisions instantly and records every resource it creates
/// and deletes.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    instances: Mutex<Vec<InstanceInfo>>,
    /// Instance ids whose snapshot creation fails fatally.
    fatal_snapshot: Mutex<HashSet<String>>,
    /// Scanner instances never become ready while set.
    hold_instances: Mutex<bool>,
    fail_discovery: Mutex<bool>,
    /// Scanner instance deletion takes this long when set.
    delete_delay: Mutex<Option<Duration>>,
    created: Mutex<Vec<Resource>>,
    deleted: Mutex<Vec<Resource>>,
    copies: AtomicUsize,
    launched: Mutex<Vec<ScanJobConfig>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(instances: Vec<InstanceInfo>) -> Arc<Self> {
        Arc::new(Self {
            instances: Mutex::new(instances),
            ..Self::default()
        })
    }

    pub fn fail_snapshot_for(&self, instance_id: &str) {
        self.fatal_snapshot.lock().insert(instance_id.to_string());
    }

    pub fn fail_discovery(&self) {
        *self.fail_discovery.lock() = true;
    }

    pub fn hold_instances(&self) {
        *self.hold_instances.lock() = true;
    }

    pub fn slow_deletes(&self, delay: Duration) {
        *self.delete_delay.lock() = Some(delay);
    }

    pub fn created(&self) -> Vec<Resource> {
        self.created.lock().clone()
    }

    pub fn deleted(&self) -> Vec<Resource> {
        self.deleted.lock().clone()
    }

    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn launched(&self) -> Vec<ScanJobConfig> {
        self.launched.lock().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn create(&self, resource: Resource) {
        self.created.lock().push(resource);
    }

    fn delete(&self, resource: Resource) {
        self.deleted.lock().push(resource);
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::External
    }

    async fn discover(
        &self,
        _scope: &ScanScope,
    ) -> ProviderResult<Vec<InstanceInfo>> {
        if *self.fail_discovery.lock() {
            return Err(ProviderError::fatal("access denied listing instances"));
        }
        Ok(self.instances.lock().clone())
    }

    async fn get_instance_root_volume(
        &self,
        instance: &InstanceInfo,
    ) -> ProviderResult<Volume> {
        Ok(Volume {
            id: format!("vol-root-{}", instance.instance_id),
            region: instance.region.clone(),
            availability_zone: instance.availability_zone.clone(),
        })
    }

    async fn create_snapshot(&self, volume: &Volume) -> ProviderResult<Snapshot> {
        let instance = volume.id.trim_start_matches("vol-root-").to_string();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fatal_snapshot.lock().contains(&instance) {
            return Err(ProviderError::fatal(format!(
                "snapshot quota exceeded for {instance}"
            )));
        }
        let snapshot = Snapshot {
            id: format!("snap-{instance}"),
            region: volume.region.clone(),
        };
        self.create(Resource::Snapshot(snapshot.id.clone()));
        Ok(snapshot)
    }

    async fn snapshot_ready(&self, _snapshot: &Snapshot) -> ProviderResult<bool> {
        Ok(true)
    }

    async fn copy_snapshot_to_region(
        &self,
        snapshot: &Snapshot,
        region: &str,
    ) -> ProviderResult<Snapshot> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        let copy = Snapshot {
            id: format!("{}-copy", snapshot.id),
            region: region.to_string(),
        };
        self.create(Resource::Snapshot(copy.id.clone()));
        Ok(copy)
    }

    async fn create_volume(
        &self,
        snapshot: &Snapshot,
        availability_zone: &str,
    ) -> ProviderResult<Volume> {
        let volume = Volume {
            id: format!("vol-{}", snapshot.id),
            region: snapshot.region.clone(),
            availability_zone: availability_zone.to_string(),
        };
        self.create(Resource::Volume(volume.id.clone()));
        Ok(volume)
    }

    async fn volume_ready(&self, _volume: &Volume) -> ProviderResult<bool> {
        Ok(true)
    }

    async fn launch_instance(
        &self,
        job: &ScanJobConfig,
    ) -> ProviderResult<Instance> {
        let instance = Instance {
            id: format!("scanner-{}", job.target.instance_id),
            region: job.region.clone(),
            availability_zone: job
                .availability_zone
                .clone()
                .unwrap_or_else(|| format!("{}a", job.region)),
        };
        self.launched.lock().push(job.clone());
        self.create(Resource::Instance(instance.id.clone()));
        Ok(instance)
    }

    async fn instance_ready(&self, _instance: &Instance) -> ProviderResult<bool> {
        Ok(!*self.hold_instances.lock())
    }

    async fn attach_volume(
        &self,
        _instance: &Instance,
        _volume: &Volume,
        _device_name: &str,
    ) -> ProviderResult<()> {
        Ok(())
    }

    async fn volume_attached(
        &self,
        _instance: &Instance,
        _volume: &Volume,
    ) -> ProviderResult<bool> {
        Ok(true)
    }

    async fn delete_instance(&self, instance: &Instance) -> ProviderResult<()> {
        let delay = *self.delete_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.delete(Resource::Instance(instance.id.clone()));
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> ProviderResult<()> {
        self.delete(Resource::Snapshot(snapshot.id.clone()));
        Ok(())
    }

    async fn delete_volume(&self, volume: &Volume) -> ProviderResult<()> {
        self.delete(Resource::Volume(volume.id.clone()));
        Ok(())
    }
}

/// Engine configuration with short intervals so paused-clock tests advance
/// quickly.
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.scanner.readiness_interval_ms = 100;
    config.scanner.result_poll_interval_ms = 100;
    config.scanner.max_parallel_scanners = 2;
    config.placement.region = "us-east-1".to_string();
    config.placement.availability_zone = Some("us-east-1b".to_string());
    config.controller_startup_delay_ms = 0;
    config.watcher.poll_interval_ms = 1_000;
    config
}

pub fn instance(id: &str, region: &str) -> InstanceInfo {
    InstanceInfo::new(id, region, format!("{region}a"))
}

pub fn sorted(mut resources: Vec<Resource>) -> Vec<Resource> {
    resources.sort();
    resources
}
