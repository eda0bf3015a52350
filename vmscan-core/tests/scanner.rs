mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use vmscan_core::config::{DeleteJobPolicy, OrchestratorConfig};
use vmscan_core::scanner::Scanner;
use vmscan_core::watcher::FiredScan;
use vmscan_model::{
    NewScan, ScanConfig, ScanResultState, ScanState, ScanStateReason,
};

use support::{
    InMemoryBackend, Resource, ScannerBehaviour, ScriptedProvider, fast_config,
    instance, sorted,
};

fn fire(backend: &InMemoryBackend, config: ScanConfig) -> FiredScan {
    let scan = backend.insert_scan(NewScan::pending(&config, Utc::now()));
    FiredScan::scheduled(scan)
}

fn scanner(
    backend: &Arc<InMemoryBackend>,
    provider: &Arc<ScriptedProvider>,
    config: &OrchestratorConfig,
) -> Scanner {
    Scanner::new(backend.clone(), provider.clone(), config)
}

#[tokio::test(start_paused = true)]
async fn one_fatal_snapshot_fails_the_scan_but_not_its_siblings() {
    let backend = InMemoryBackend::new();
    let provider = ScriptedProvider::new(vec![
        instance("i-1", "us-east-1"),
        instance("i-2", "us-east-1"),
        instance("i-3", "us-east-1"),
    ]);
    provider.fail_snapshot_for("i-2");
    let config = ScanConfig::new("nightly").with_max_parallel_scanners(2);
    let fired = fire(&backend, config);
    let scan_id = fired.scan.id;

    let outcome = scanner(&backend, &provider, &fast_config())
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(outcome.state, ScanState::Failed);
    assert_eq!(outcome.reason, ScanStateReason::OneOrMoreTargetFailedToScan);
    assert_eq!(
        outcome.message,
        "2 succeeded, 1 failed out of 3 total target scans"
    );
    assert!(provider.peak_in_flight() <= 2, "pool size exceeded");

    let scan = backend.scan(scan_id).expect("scan stored");
    assert_eq!(scan.state, ScanState::Failed);
    assert_eq!(scan.target_ids.len(), 3);
    assert_eq!(scan.summary.jobs_completed, 3);
    assert_eq!(scan.summary.jobs_left_to_run, 0);
    assert!(scan.end_time.is_some());

    let failed: Vec<_> = backend
        .results()
        .into_iter()
        .filter(|r| r.status.has_errors())
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status.state, Some(ScanResultState::Done));

    assert_eq!(sorted(provider.created()), sorted(provider.deleted()));
}

#[tokio::test(start_paused = true)]
async fn scan_walks_through_discovered_and_in_progress_before_done() {
    let backend = InMemoryBackend::new();
    let provider = ScriptedProvider::new(vec![
        instance("i-1", "us-east-1"),
        instance("i-2", "us-east-1"),
        instance("i-3", "us-east-1"),
    ]);
    let fired = fire(&backend, ScanConfig::new("all-good"));
    let scan_id = fired.scan.id;

    let outcome = scanner(&backend, &provider, &fast_config())
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(outcome.state, ScanState::Done);
    assert_eq!(outcome.reason, ScanStateReason::Success);
    assert_eq!(
        outcome.message,
        "3 succeeded, 0 failed out of 3 total target scans"
    );

    let states: Vec<_> = backend
        .scan_patches(scan_id)
        .into_iter()
        .filter_map(|patch| patch.state)
        .collect();
    assert_eq!(
        states,
        vec![ScanState::Discovered, ScanState::InProgress, ScanState::Done]
    );
    assert!(
        backend
            .results()
            .iter()
            .all(|r| r.status.state == Some(ScanResultState::Done))
    );
}

#[tokio::test(start_paused = true)]
async fn scanner_reported_errors_fail_the_target() {
    let backend = InMemoryBackend::new();
    backend.fail_scanner_for("i-2");
    let provider = ScriptedProvider::new(vec![
        instance("i-1", "us-east-1"),
        instance("i-2", "us-east-1"),
    ]);
    let fired = fire(&backend, ScanConfig::new("scanner-errors"));

    let outcome = scanner(&backend, &provider, &fast_config())
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(outcome.state, ScanState::Failed);
    assert_eq!((outcome.succeeded, outcome.failed), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn same_region_snapshots_are_not_copied() {
    let backend = InMemoryBackend::new();
    let provider = ScriptedProvider::new(vec![instance("i-1", "us-east-1")]);
    let fired = fire(&backend, ScanConfig::new("local"));

    scanner(&backend, &provider, &fast_config())
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(provider.copies(), 0);
    assert!(
        !provider
            .created()
            .contains(&Resource::Snapshot("snap-i-1-copy".into()))
    );
}

#[tokio::test(start_paused = true)]
async fn cross_region_snapshots_are_copied_and_both_copies_cleaned() {
    let backend = InMemoryBackend::new();
    let provider = ScriptedProvider::new(vec![instance("i-1", "eu-west-1")]);
    let fired = fire(&backend, ScanConfig::new("remote"));

    let outcome = scanner(&backend, &provider, &fast_config())
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(outcome.state, ScanState::Done);
    assert_eq!(provider.copies(), 1);

    let launched = provider.launched();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].region, "us-east-1");
    assert_eq!(launched[0].target.instance_id, "i-1");

    let deleted = provider.deleted();
    assert!(deleted.contains(&Resource::Snapshot("snap-i-1".into())));
    assert!(deleted.contains(&Resource::Snapshot("snap-i-1-copy".into())));
    assert!(deleted.contains(&Resource::Volume("vol-snap-i-1-copy".into())));
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_provisioning_aborts_and_cleans_every_resource_once() {
    let backend = InMemoryBackend::new();
    let provider = ScriptedProvider::new(vec![
        instance("i-1", "us-east-1"),
        instance("i-2", "eu-west-1"),
    ]);
    provider.hold_instances();
    let mut config = fast_config();
    // Uncompleted jobs are cleaned up even when completed ones are retained.
    config.scanner.delete_job_policy = DeleteJobPolicy::Never;
    let fired = fire(&backend, ScanConfig::new("cancelled"));
    let scan_id = fired.scan.id;

    let cancel = CancellationToken::new();
    let scanner = scanner(&backend, &provider, &config);
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { scanner.run_scan(fired, cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        backend.scan(scan_id).map(|scan| scan.state),
        Some(ScanState::InProgress)
    );
    cancel.cancel();

    let outcome = run.await.expect("join").expect("scan runs");
    assert_eq!(outcome.state, ScanState::Failed);
    assert_eq!(outcome.reason, ScanStateReason::Aborted);
    assert_eq!(outcome.message, "Scan has been aborted");

    let created = sorted(provider.created());
    let deleted = sorted(provider.deleted());
    assert!(!created.is_empty());
    assert_eq!(created, deleted, "every resource deleted exactly once");

    assert!(
        backend
            .results()
            .iter()
            .all(|r| r.status.state == Some(ScanResultState::Aborted))
    );
}

#[tokio::test(start_paused = true)]
async fn aborted_scan_is_failed_before_slow_cleanup_finishes() {
    let backend = InMemoryBackend::new();
    let provider = ScriptedProvider::new(vec![instance("i-1", "us-east-1")]);
    provider.hold_instances();
    provider.slow_deletes(Duration::from_secs(600));
    let fired = fire(&backend, ScanConfig::new("slow-cleanup"));
    let scan_id = fired.scan.id;

    let cancel = CancellationToken::new();
    let scanner = scanner(&backend, &provider, &fast_config());
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { scanner.run_scan(fired, cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    cancel.cancel();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let scan = backend.scan(scan_id).expect("scan stored");
    assert_eq!(scan.state, ScanState::Failed);
    assert_eq!(scan.state_reason, Some(ScanStateReason::Aborted));
    assert!(scan.end_time.is_some());
    assert!(
        !provider
            .deleted()
            .contains(&Resource::Instance("scanner-i-1".into())),
        "scanner instance is still being deleted"
    );

    let outcome = run.await.expect("join").expect("scan runs");
    assert_eq!(outcome.reason, ScanStateReason::Aborted);
    assert_eq!(sorted(provider.created()), sorted(provider.deleted()));
}

#[tokio::test(start_paused = true)]
async fn result_without_state_fails_only_that_target() {
    let backend = InMemoryBackend::new();
    backend.report_without_state_for("i-2");
    let provider = ScriptedProvider::new(vec![
        instance("i-1", "us-east-1"),
        instance("i-2", "us-east-1"),
        instance("i-3", "us-east-1"),
    ]);
    let fired = fire(&backend, ScanConfig::new("blank-report"));

    let outcome = scanner(&backend, &provider, &fast_config())
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(outcome.state, ScanState::Failed);
    assert_eq!(outcome.reason, ScanStateReason::OneOrMoreTargetFailedToScan);
    assert_eq!((outcome.succeeded, outcome.failed), (2, 1));
    assert_eq!(outcome.timed_out, 0);
    assert_eq!(sorted(provider.created()), sorted(provider.deleted()));
}

#[tokio::test(start_paused = true)]
async fn provisioning_timeouts_are_not_counted_as_result_timeouts() {
    let backend = InMemoryBackend::new();
    let provider = ScriptedProvider::new(vec![instance("i-1", "us-east-1")]);
    provider.hold_instances();
    let mut config = fast_config();
    config.scanner.instance_ready_timeout_ms = 2_000;
    let fired = fire(&backend, ScanConfig::new("stuck-instance"));

    let outcome = scanner(&backend, &provider, &config)
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(outcome.state, ScanState::Failed);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.timed_out, 0);
}

#[tokio::test(start_paused = true)]
async fn scan_timeout_preempts_waiting_targets() {
    let backend = InMemoryBackend::new();
    backend.set_scanner(ScannerBehaviour::Silent);
    let provider = ScriptedProvider::new(vec![instance("i-1", "us-east-1")]);
    let mut config = ScanConfig::new("slow");
    config.timeout_seconds = Some(60);
    let fired = fire(&backend, config);

    let outcome = scanner(&backend, &provider, &fast_config())
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(outcome.state, ScanState::Failed);
    assert_eq!(outcome.reason, ScanStateReason::TimedOut);
    assert_eq!(sorted(provider.created()), sorted(provider.deleted()));
}

#[tokio::test(start_paused = true)]
async fn silent_scanners_time_out_per_target() {
    let backend = InMemoryBackend::new();
    backend.set_scanner(ScannerBehaviour::Silent);
    let provider = ScriptedProvider::new(vec![instance("i-1", "us-east-1")]);
    let mut config = fast_config();
    config.scanner.result_timeout_ms = 10_000;
    let fired = fire(&backend, ScanConfig::new("quiet"));

    let outcome = scanner(&backend, &provider, &config)
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(outcome.state, ScanState::Failed);
    assert_eq!(outcome.reason, ScanStateReason::OneOrMoreTargetFailedToScan);
    assert_eq!((outcome.failed, outcome.timed_out), (1, 1));
    let results = backend.results();
    assert_eq!(results[0].status.state, Some(ScanResultState::Done));
    assert!(results[0].status.has_errors());
}

#[tokio::test(start_paused = true)]
async fn never_policy_retains_completed_resources() {
    let backend = InMemoryBackend::new();
    let provider = ScriptedProvider::new(vec![instance("i-1", "us-east-1")]);
    let mut config = fast_config();
    config.scanner.delete_job_policy = DeleteJobPolicy::Never;
    let fired = fire(&backend, ScanConfig::new("forensics"));

    let outcome = scanner(&backend, &provider, &config)
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(outcome.state, ScanState::Done);
    assert!(!provider.created().is_empty());
    assert!(provider.deleted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn on_success_policy_keeps_failed_targets_for_inspection() {
    let backend = InMemoryBackend::new();
    backend.fail_scanner_for("i-2");
    let provider = ScriptedProvider::new(vec![
        instance("i-1", "us-east-1"),
        instance("i-2", "us-east-1"),
    ]);
    let mut config = fast_config();
    config.scanner.delete_job_policy = DeleteJobPolicy::OnSuccess;
    let fired = fire(&backend, ScanConfig::new("keep-failures"));

    scanner(&backend, &provider, &config)
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    let deleted = provider.deleted();
    assert!(deleted.contains(&Resource::Instance("scanner-i-1".into())));
    assert!(!deleted.contains(&Resource::Instance("scanner-i-2".into())));
    assert!(!deleted.contains(&Resource::Snapshot("snap-i-2".into())));
}

#[tokio::test(start_paused = true)]
async fn empty_discovery_finishes_with_nothing_to_scan() {
    let backend = InMemoryBackend::new();
    let provider = ScriptedProvider::new(Vec::new());
    let fired = fire(&backend, ScanConfig::new("empty"));
    let scan_id = fired.scan.id;

    let outcome = scanner(&backend, &provider, &fast_config())
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(outcome.state, ScanState::Done);
    assert_eq!(outcome.reason, ScanStateReason::NothingToScan);
    assert!(backend.scan(scan_id).and_then(|s| s.end_time).is_some());
}

#[tokio::test(start_paused = true)]
async fn discovery_failure_fails_the_scan() {
    let backend = InMemoryBackend::new();
    let provider = ScriptedProvider::new(vec![instance("i-1", "us-east-1")]);
    provider.fail_discovery();
    let fired = fire(&backend, ScanConfig::new("denied"));

    let outcome = scanner(&backend, &provider, &fast_config())
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(outcome.state, ScanState::Failed);
    assert_eq!(outcome.reason, ScanStateReason::DiscoveryFailed);
    assert!(provider.created().is_empty());
}

#[tokio::test(start_paused = true)]
async fn duplicate_discoveries_become_one_target() {
    let backend = InMemoryBackend::new();
    let provider = ScriptedProvider::new(vec![
        instance("i-1", "us-east-1"),
        instance("i-1", "us-east-1"),
    ]);
    let fired = fire(&backend, ScanConfig::new("dupes"));

    let outcome = scanner(&backend, &provider, &fast_config())
        .run_scan(fired, CancellationToken::new())
        .await
        .expect("scan runs");

    assert_eq!(outcome.total, 1);
    assert_eq!(provider.launched().len(), 1);
}
