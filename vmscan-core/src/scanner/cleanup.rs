use vmscan_model::TargetInstance;

use crate::config::DeleteJobPolicy;
use crate::provider::ProviderClient;

use super::state::{JobResources, PerTargetScanState};

/// Tally of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Whether the resources of `state` should be torn down under `policy`.
///
/// Jobs that never reached a verdict are always torn down.
pub fn should_clean(policy: DeleteJobPolicy, state: &PerTargetScanState) -> bool {
    !state.completed || policy.should_delete(state.success)
}

/// Delete every resource recorded for a target, instance first.
///
/// Each deletion is attempted on its own; failures are logged and do not stop
/// the remaining deletions.
pub async fn delete_resources(
    provider: &dyn ProviderClient,
    target: &TargetInstance,
    resources: &JobResources,
) -> CleanupReport {
    let mut report = CleanupReport::default();
    let location = target.instance.location();

    if let Some(instance) = &resources.instance {
        let outcome = provider.delete_instance(instance).await;
        tally(&mut report, &location, "instance", &instance.id, outcome);
    }
    if let Some(volume) = &resources.volume {
        let outcome = provider.delete_volume(volume).await;
        tally(&mut report, &location, "volume", &volume.id, outcome);
    }
    if let Some(snapshot) = &resources.dst_snapshot {
        let outcome = provider.delete_snapshot(snapshot).await;
        tally(&mut report, &location, "copied snapshot", &snapshot.id, outcome);
    }
    if let Some(snapshot) = &resources.src_snapshot {
        let outcome = provider.delete_snapshot(snapshot).await;
        tally(&mut report, &location, "snapshot", &snapshot.id, outcome);
    }

    report
}

fn tally<E: std::fmt::Display>(
    report: &mut CleanupReport,
    location: &str,
    kind: &str,
    id: &str,
    outcome: Result<(), E>,
) {
    match outcome {
        Ok(()) => {
            report.deleted += 1;
            tracing::debug!(
                target: "vmscan::job",
                target_instance = %location,
                resource = kind,
                id,
                "Deleted scan resource"
            );
        }
        Err(err) => {
            report.failed += 1;
            tracing::warn!(
                target: "vmscan::job",
                target_instance = %location,
                resource = kind,
                id,
                error = %err,
                "Failed to delete scan resource"
            );
        }
    }
}
