//! `VMSCAN_*` environment overrides.

use std::str::FromStr;

use vmscan_core::config::DeleteJobPolicy;
use vmscan_core::provider::ProviderKind;

use crate::error::ConfigLoadError;
use crate::settings::Settings;
use crate::util::{duration_ms, parse_duration};

pub const CONFIG_PATH: &str = "VMSCAN_CONFIG_PATH";
pub const CONFIG_JSON: &str = "VMSCAN_CONFIG_JSON";

/// Reads variables through an injectable lookup so tests never touch the
/// process environment.
pub struct EnvOverrides<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl std::fmt::Debug for EnvOverrides<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvOverrides").finish_non_exhaustive()
    }
}

impl<'a> EnvOverrides<'a> {
    pub fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { lookup }
    }

    /// Non-empty, trimmed value of `var`.
    pub fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, var: &'static str, slot: &mut String) {
        if let Some(value) = self.get(var) {
            *slot = value;
        }
    }

    fn optional(&self, var: &'static str, slot: &mut Option<String>) {
        if let Some(value) = self.get(var) {
            *slot = Some(value);
        }
    }

    fn parsed<T>(
        &self,
        var: &'static str,
        slot: &mut T,
    ) -> Result<(), ConfigLoadError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.get(var) {
            *slot = value.parse().map_err(|err: T::Err| {
                ConfigLoadError::InvalidEnv {
                    var,
                    reason: err.to_string(),
                    value,
                }
            })?;
        }
        Ok(())
    }

    fn duration(
        &self,
        var: &'static str,
        slot_ms: &mut u64,
    ) -> Result<(), ConfigLoadError> {
        if let Some(value) = self.get(var) {
            let duration = parse_duration(&value).map_err(|reason| {
                ConfigLoadError::InvalidEnv { var, value, reason }
            })?;
            *slot_ms = duration_ms(duration);
        }
        Ok(())
    }

    /// Apply every recognised override to `settings`.
    pub fn apply(&self, settings: &mut Settings) -> Result<(), ConfigLoadError> {
        let backend = &mut settings.backend;
        self.string("VMSCAN_BACKEND_ADDRESS", &mut backend.address);
        self.duration("VMSCAN_BACKEND_TIMEOUT", &mut backend.request_timeout_ms)?;

        let provider = &mut settings.provider;
        self.parsed::<ProviderKind>("VMSCAN_PROVIDER", &mut provider.kind)?;
        self.optional("VMSCAN_PLUGIN_ADDRESS", &mut provider.plugin_address);
        self.duration("VMSCAN_PLUGIN_TIMEOUT", &mut provider.request_timeout_ms)?;

        let orchestrator = &mut settings.orchestrator;
        self.duration(
            "VMSCAN_CONTROLLER_STARTUP_DELAY",
            &mut orchestrator.controller_startup_delay_ms,
        )?;

        let watcher = &mut orchestrator.watcher;
        self.duration("VMSCAN_POLL_INTERVAL", &mut watcher.poll_interval_ms)?;
        self.duration(
            "VMSCAN_RECONCILE_TIMEOUT",
            &mut watcher.reconcile_timeout_ms,
        )?;
        self.duration("VMSCAN_SCHEDULE_WINDOW", &mut watcher.schedule_window_ms)?;
        self.duration("VMSCAN_ORPHAN_TIMEOUT", &mut watcher.orphan_timeout_ms)?;

        let placement = &mut orchestrator.placement;
        self.string("VMSCAN_REGION", &mut placement.region);
        self.optional(
            "VMSCAN_AVAILABILITY_ZONE",
            &mut placement.availability_zone,
        );
        self.string("VMSCAN_SCANNER_IMAGE", &mut placement.scanner_image);
        self.string(
            "VMSCAN_SCANNER_INSTANCE_TYPE",
            &mut placement.instance_type,
        );
        self.string(
            "VMSCAN_BLOCK_DEVICE_NAME",
            &mut placement.block_device_name,
        );
        self.string(
            "VMSCAN_SCANNER_BACKEND_ADDRESS",
            &mut placement.scanner_backend_address,
        );

        let scanner = &mut orchestrator.scanner;
        self.parsed::<u32>(
            "VMSCAN_MAX_PARALLEL_SCANNERS",
            &mut scanner.max_parallel_scanners,
        )?;
        self.parsed::<DeleteJobPolicy>(
            "VMSCAN_DELETE_JOB_POLICY",
            &mut scanner.delete_job_policy,
        )?;
        for (var, slot) in [
            ("VMSCAN_SCAN_TIMEOUT", &mut scanner.scan_timeout_ms),
            ("VMSCAN_DISCOVERY_TIMEOUT", &mut scanner.discovery_timeout_ms),
            (
                "VMSCAN_PROVIDER_CALL_TIMEOUT",
                &mut scanner.provider_call_timeout_ms,
            ),
            ("VMSCAN_READINESS_INTERVAL", &mut scanner.readiness_interval_ms),
            (
                "VMSCAN_SNAPSHOT_READY_TIMEOUT",
                &mut scanner.snapshot_ready_timeout_ms,
            ),
            (
                "VMSCAN_SNAPSHOT_COPY_TIMEOUT",
                &mut scanner.snapshot_copy_timeout_ms,
            ),
            (
                "VMSCAN_VOLUME_READY_TIMEOUT",
                &mut scanner.volume_ready_timeout_ms,
            ),
            (
                "VMSCAN_INSTANCE_READY_TIMEOUT",
                &mut scanner.instance_ready_timeout_ms,
            ),
            (
                "VMSCAN_VOLUME_ATTACH_TIMEOUT",
                &mut scanner.volume_attach_timeout_ms,
            ),
            (
                "VMSCAN_RESULT_POLL_INTERVAL",
                &mut scanner.result_poll_interval_ms,
            ),
            ("VMSCAN_RESULT_TIMEOUT", &mut scanner.result_timeout_ms),
        ] {
            self.duration(var, slot)?;
        }

        let tools = &mut orchestrator.tools;
        self.string(
            "VMSCAN_GITLEAKS_BINARY_PATH",
            &mut tools.gitleaks_binary_path,
        );
        self.string("VMSCAN_LYNIS_INSTALL_PATH", &mut tools.lynis_install_path);
        self.string(
            "VMSCAN_CHKROOTKIT_BINARY_PATH",
            &mut tools.chkrootkit_binary_path,
        );
        self.string("VMSCAN_CLAM_BINARY_PATH", &mut tools.clam_binary_path);
        self.string(
            "VMSCAN_FRESHCLAM_BINARY_PATH",
            &mut tools.freshclam_binary_path,
        );
        self.optional(
            "VMSCAN_FRESHCLAM_MIRROR",
            &mut tools.alternative_freshclam_mirror_url,
        );
        self.string("VMSCAN_EXPLOIT_DB_ADDRESS", &mut tools.exploit_db_address);
        self.optional(
            "VMSCAN_TRIVY_SERVER_ADDRESS",
            &mut tools.trivy_server_address,
        );
        self.duration(
            "VMSCAN_TRIVY_SERVER_TIMEOUT",
            &mut tools.trivy_server_timeout_ms,
        )?;
        self.optional(
            "VMSCAN_GRYPE_SERVER_ADDRESS",
            &mut tools.grype_server_address,
        );
        self.duration(
            "VMSCAN_GRYPE_SERVER_TIMEOUT",
            &mut tools.grype_server_timeout_ms,
        )?;

        Ok(())
    }
}
