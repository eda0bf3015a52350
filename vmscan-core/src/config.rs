use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so deployments only need to supply what they
/// override.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Pause between starting consecutive controllers so they do not hit the
    /// backend in the same instant (ms).
    pub controller_startup_delay_ms: u64,
    /// Scan configuration polling and schedule evaluation.
    pub watcher: WatcherConfig,
    /// Worker pool, timeouts and cleanup policy for running scans.
    pub scanner: ScannerConfig,
    /// Where scanner instances are launched.
    pub placement: PlacementConfig,
    /// Binary paths and service addresses forwarded to the scanners.
    pub tools: ScannerToolsConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            watcher: WatcherConfig::default(),
            scanner: ScannerConfig::default(),
            placement: PlacementConfig::default(),
            tools: ScannerToolsConfig::default(),
            controller_startup_delay_ms: 15_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn controller_startup_delay(&self) -> Duration {
        Duration::from_millis(self.controller_startup_delay_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatcherConfig {
    /// Interval between scan configuration polls (ms).
    pub poll_interval_ms: u64,
    /// Upper bound for a single poll cycle (ms).
    pub reconcile_timeout_ms: u64,
    /// Width of the window centred on "now" used to decide whether an
    /// operation time is due (ms). Keep it at least as wide as the poll
    /// interval or ticks can slip between polls.
    pub schedule_window_ms: u64,
    /// Page size for scan configuration listings.
    pub page_size: u32,
    /// An unfinished scan whose heartbeat is older than this is treated as
    /// abandoned by the orchestrator that ran it (ms). Running scans beat
    /// once per poll interval.
    pub orphan_timeout_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 15_000,
            reconcile_timeout_ms: 300_000,
            schedule_window_ms: 60_000,
            page_size: 100,
            orphan_timeout_ms: 120_000,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }

    pub fn schedule_window(&self) -> Duration {
        Duration::from_millis(self.schedule_window_ms)
    }

    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_millis(self.orphan_timeout_ms)
    }
}

/// Retention policy for the ephemeral resources of a finished target scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeleteJobPolicy {
    Never,
    #[default]
    Always,
    OnSuccess,
}

impl DeleteJobPolicy {
    /// Whether a completed job with the given outcome should be torn down.
    pub fn should_delete(self, success: bool) -> bool {
        match self {
            DeleteJobPolicy::Never => false,
            DeleteJobPolicy::Always => true,
            DeleteJobPolicy::OnSuccess => success,
        }
    }
}

impl fmt::Display for DeleteJobPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeleteJobPolicy::Never => "Never",
            DeleteJobPolicy::Always => "Always",
            DeleteJobPolicy::OnSuccess => "OnSuccess",
        })
    }
}

impl FromStr for DeleteJobPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(DeleteJobPolicy::Never),
            "always" => Ok(DeleteJobPolicy::Always),
            "onsuccess" | "on_success" | "on-success" => {
                Ok(DeleteJobPolicy::OnSuccess)
            }
            other => Err(format!("unknown delete job policy `{other}`")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScannerConfig {
    /// Worker pool size when the scan configuration does not set one.
    pub max_parallel_scanners: u32,
    pub delete_job_policy: DeleteJobPolicy,
    /// Scan-wide timeout when the scan configuration does not set one (ms).
    pub scan_timeout_ms: u64,
    /// Budget for instance discovery, including retries (ms).
    pub discovery_timeout_ms: u64,
    /// Budget for a single create/launch/attach call, including retries (ms).
    pub provider_call_timeout_ms: u64,
    /// Tick between readiness probes (ms).
    pub readiness_interval_ms: u64,
    pub snapshot_ready_timeout_ms: u64,
    /// Cross-region copies routinely take much longer than other waits.
    pub snapshot_copy_timeout_ms: u64,
    pub volume_ready_timeout_ms: u64,
    pub instance_ready_timeout_ms: u64,
    pub volume_attach_timeout_ms: u64,
    /// Interval between scan result status polls (ms).
    pub result_poll_interval_ms: u64,
    /// How long a scanner may take to report a final result (ms).
    pub result_timeout_ms: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_parallel_scanners: 2,
            delete_job_policy: DeleteJobPolicy::Always,
            scan_timeout_ms: 48 * 60 * 60 * 1_000,
            discovery_timeout_ms: 5 * 60 * 1_000,
            provider_call_timeout_ms: 5 * 60 * 1_000,
            readiness_interval_ms: 5_000,
            snapshot_ready_timeout_ms: 30 * 60 * 1_000,
            snapshot_copy_timeout_ms: 90 * 60 * 1_000,
            volume_ready_timeout_ms: 30 * 60 * 1_000,
            instance_ready_timeout_ms: 30 * 60 * 1_000,
            volume_attach_timeout_ms: 30 * 60 * 1_000,
            result_poll_interval_ms: 60_000,
            result_timeout_ms: 4 * 60 * 60 * 1_000,
        }
    }
}

impl ScannerConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn result_poll_interval(&self) -> Duration {
        Duration::from_millis(self.result_poll_interval_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn provider_call_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_call_timeout_ms)
    }

    pub fn snapshot_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_ready_timeout_ms)
    }

    pub fn snapshot_copy_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_copy_timeout_ms)
    }

    pub fn volume_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.volume_ready_timeout_ms)
    }

    pub fn instance_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.instance_ready_timeout_ms)
    }

    pub fn volume_attach_timeout(&self) -> Duration {
        Duration::from_millis(self.volume_attach_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlacementConfig {
    /// Region scanner instances run in. Snapshots from other regions are
    /// copied here first.
    pub region: String,
    /// Availability zone for scanner instances; the provider picks one when
    /// unset.
    pub availability_zone: Option<String>,
    pub scanner_image: String,
    pub instance_type: String,
    /// Device name the target volume is attached under.
    pub block_device_name: String,
    /// Backend address the scanner reports results to.
    pub scanner_backend_address: String,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            availability_zone: None,
            scanner_image: "vmscan/scanner-cli:latest"
                .to_string(),
            instance_type: "t2.large".to_string(),
            block_device_name: "xvdh".to_string(),
            scanner_backend_address: "http://localhost:8888/api".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScannerToolsConfig {
    pub gitleaks_binary_path: String,
    pub lynis_install_path: String,
    pub chkrootkit_binary_path: String,
    pub clam_binary_path: String,
    pub freshclam_binary_path: String,
    pub alternative_freshclam_mirror_url: Option<String>,
    pub exploit_db_address: String,
    pub trivy_server_address: Option<String>,
    pub trivy_server_timeout_ms: u64,
    pub grype_server_address: Option<String>,
    pub grype_server_timeout_ms: u64,
}

impl Default for ScannerToolsConfig {
    fn default() -> Self {
        Self {
            gitleaks_binary_path: "/artifacts/gitleaks".to_string(),
            lynis_install_path: "/artifacts/lynis".to_string(),
            chkrootkit_binary_path: "/artifacts/chkrootkit".to_string(),
            clam_binary_path: "clamscan".to_string(),
            freshclam_binary_path: "freshclam".to_string(),
            alternative_freshclam_mirror_url: None,
            exploit_db_address: "http://localhost:1326".to_string(),
            trivy_server_address: None,
            trivy_server_timeout_ms: 5 * 60 * 1_000,
            grype_server_address: None,
            grype_server_timeout_ms: 2 * 60 * 1_000,
        }
    }
}
