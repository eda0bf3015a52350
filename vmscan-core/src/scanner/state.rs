use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use vmscan_model::{ScanResultId, TargetId, TargetInstance};

use crate::provider::{Instance, Snapshot, Volume};

/// Progress of a single target through provisioning and result collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobStage {
    Pending,
    RootVolumeResolved,
    SnapshotTaken,
    SnapshotReady,
    SnapshotCopied,
    CopyReady,
    ScannerLaunched,
    VolumeFromSnapshotCreated,
    VolumeReady,
    InstanceReady,
    VolumeAttached,
    AttachedConfirmed,
    ResultReceived,
    Finished,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Ephemeral cloud resources created on behalf of one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResources {
    pub src_snapshot: Option<Snapshot>,
    /// Only set when the source snapshot had to be copied across regions.
    pub dst_snapshot: Option<Snapshot>,
    pub volume: Option<Volume>,
    pub instance: Option<Instance>,
}

impl JobResources {
    pub fn is_empty(&self) -> bool {
        self.src_snapshot.is_none()
            && self.dst_snapshot.is_none()
            && self.volume.is_none()
            && self.instance.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerTargetScanState {
    pub target: TargetInstance,
    pub scan_result_id: Option<ScanResultId>,
    pub stage: JobStage,
    pub success: bool,
    /// Set once the target reached a verdict. Cancelled jobs stay
    /// uncompleted, which forces cleanup regardless of policy.
    pub completed: bool,
    pub timed_out: bool,
    pub error: Option<String>,
    pub resources: JobResources,
}

impl PerTargetScanState {
    pub fn new(target: TargetInstance) -> Self {
        Self {
            target,
            scan_result_id: None,
            stage: JobStage::Pending,
            success: false,
            completed: false,
            timed_out: false,
            error: None,
            resources: JobResources::default(),
        }
    }
}

/// Per-target state of one scan, shared by its workers and its aggregation
/// loop.
///
/// Workers only ever touch their own entry. The lock is never held across an
/// await point.
#[derive(Debug, Default)]
pub struct TargetStates {
    inner: Mutex<HashMap<TargetId, PerTargetScanState>>,
}

impl TargetStates {
    pub fn new(targets: impl IntoIterator<Item = TargetInstance>) -> Self {
        let inner = targets
            .into_iter()
            .map(|target| (target.target_id, PerTargetScanState::new(target)))
            .collect();
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn get(&self, id: &TargetId) -> Option<PerTargetScanState> {
        self.inner.lock().get(id).cloned()
    }

    pub fn update<R>(
        &self,
        id: &TargetId,
        apply: impl FnOnce(&mut PerTargetScanState) -> R,
    ) -> Option<R> {
        self.inner.lock().get_mut(id).map(apply)
    }

    pub fn advance(&self, id: &TargetId, stage: JobStage) {
        self.update(id, |state| state.stage = stage);
    }

    pub fn set_scan_result(&self, id: &TargetId, result: ScanResultId) {
        self.update(id, |state| state.scan_result_id = Some(result));
    }

    pub fn record(&self, id: &TargetId, apply: impl FnOnce(&mut JobResources)) {
        self.update(id, |state| apply(&mut state.resources));
    }

    /// Record the verdict of a target that ran to an end.
    pub fn complete(
        &self,
        id: &TargetId,
        success: bool,
        timed_out: bool,
        error: Option<String>,
    ) {
        self.update(id, |state| {
            state.completed = true;
            state.success = success;
            state.timed_out = timed_out;
            state.error = error;
        });
    }

    /// Record that a target was interrupted before reaching a verdict.
    pub fn interrupt(&self, id: &TargetId, reason: impl Into<String>) {
        self.update(id, |state| {
            state.completed = false;
            state.success = false;
            state.error = Some(reason.into());
        });
    }

    pub fn snapshot(&self) -> Vec<PerTargetScanState> {
        self.inner.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use vmscan_model::InstanceInfo;

    use super::*;

    fn target(name: &str) -> TargetInstance {
        TargetInstance {
            target_id: TargetId::new(),
            instance: InstanceInfo::new(name, "us-east-1", "us-east-1a"),
        }
    }

    #[test]
    fn accessors_only_touch_the_addressed_target() {
        let (a, b) = (target("i-a"), target("i-b"));
        let states = TargetStates::new([a.clone(), b.clone()]);

        states.advance(&a.target_id, JobStage::SnapshotTaken);
        states.record(&a.target_id, |r| {
            r.src_snapshot = Some(Snapshot {
                id: "snap-a".into(),
                region: "us-east-1".into(),
            })
        });
        states.complete(&a.target_id, true, false, None);

        let a_state = states.get(&a.target_id).expect("a");
        let b_state = states.get(&b.target_id).expect("b");
        assert_eq!(a_state.stage, JobStage::SnapshotTaken);
        assert!(a_state.completed && a_state.success);
        assert!(!a_state.resources.is_empty());
        assert_eq!(b_state, PerTargetScanState::new(b));
    }

    #[test]
    fn interrupted_targets_stay_uncompleted() {
        let a = target("i-a");
        let states = TargetStates::new([a.clone()]);

        states.interrupt(&a.target_id, "cancelled");

        let state = states.get(&a.target_id).expect("a");
        assert!(!state.completed);
        assert_eq!(state.error.as_deref(), Some("cancelled"));
    }
}
