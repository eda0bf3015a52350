use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use url::Url;
use vmscan_core::config::OrchestratorConfig;
use vmscan_core::provider::ProviderKind;
use vmscan_core::provider::external::ExternalProviderConfig;

use crate::env::{CONFIG_JSON, CONFIG_PATH, EnvOverrides};
use crate::error::ConfigLoadError;

/// Where the file-level settings came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SettingsSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Base URL of the backend REST API.
    pub address: String,
    pub request_timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            address: "http://localhost:8888/api".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    /// Address of the out-of-process provider plugin.
    pub plugin_address: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::External,
            plugin_address: None,
            request_timeout_ms: 60_000,
        }
    }
}

/// Fully resolved orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendSettings,
    pub provider: ProviderSettings,
    pub orchestrator: OrchestratorConfig,
}

/// Result of [`Settings::load`].
#[derive(Debug, Clone)]
pub struct SettingsLoad {
    pub settings: Settings,
    pub source: SettingsSource,
    pub env_file_loaded: bool,
}

impl Settings {
    /// Load settings from `.env`, the optional config file and the process
    /// environment.
    pub fn load() -> anyhow::Result<SettingsLoad> {
        let env_file_loaded = Self::load_env_file()?;
        let mut load = Self::load_with(&|var| std::env::var(var).ok())?;
        load.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Export the variables of a `.env` file into the process environment.
    /// Returns whether one was found.
    pub fn load_env_file() -> anyhow::Result<bool> {
        match dotenvy::dotenv() {
            Ok(path) => {
                tracing::debug!(path = %path.display(), "Loaded .env file");
                Ok(true)
            }
            Err(err) if err.not_found() => Ok(false),
            Err(err) => Err(err).context("failed to read .env file"),
        }
    }

    /// Same as [`Settings::load`] without `.env` handling, reading variables
    /// through `lookup`.
    ///
    /// Evaluation order:
    /// 1) `$VMSCAN_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$VMSCAN_CONFIG_JSON` (inline JSON),
    /// 3) `vmscan.toml` / `config/vmscan.toml` when present,
    /// 4) defaults,
    ///
    /// then every `VMSCAN_*` override on top.
    pub fn load_with(
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> anyhow::Result<SettingsLoad> {
        let env = EnvOverrides::new(lookup);

        let (mut settings, source) = if let Some(path) = env.get(CONFIG_PATH) {
            let path = PathBuf::from(path);
            (Self::load_from_file(&path)?, SettingsSource::EnvPath(path))
        } else if let Some(raw) = env.get(CONFIG_JSON) {
            let settings = Self::parse_json(&raw)
                .with_context(|| format!("failed to parse {CONFIG_JSON}"))?;
            (settings, SettingsSource::EnvInline)
        } else if let Some(path) = Self::find_default_file() {
            (Self::load_from_file(&path)?, SettingsSource::File(path))
        } else {
            (Self::default(), SettingsSource::Default)
        };

        env.apply(&mut settings)?;
        settings.validate()?;

        Ok(SettingsLoad {
            settings,
            source,
            env_file_loaded: false,
        })
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| {
            format!("failed to read config from {}", path.display())
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents).with_context(|| {
                format!("invalid config {}", path.display())
            }),
            Some("toml") => toml::from_str(&contents).map_err(|err| {
                anyhow!("invalid config {}: {}", path.display(), err)
            }),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    /// Try TOML first, then JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| anyhow!("invalid config json: {err}"))
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &[
            "vmscan.toml",
            "vmscan.json",
            "config/vmscan.toml",
            "config/vmscan.json",
        ];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(Path::to_path_buf)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        self.backend_url()?;
        if self.provider.kind == ProviderKind::External {
            self.plugin_config()?;
        }

        let scanner = &self.orchestrator.scanner;
        if scanner.readiness_interval_ms == 0
            || scanner.result_poll_interval_ms == 0
            || self.orchestrator.watcher.poll_interval_ms == 0
        {
            return Err(ConfigLoadError::Invalid(
                "poll and readiness intervals must be non-zero".into(),
            ));
        }

        let watcher = &self.orchestrator.watcher;
        if watcher.orphan_timeout_ms < watcher.poll_interval_ms.saturating_mul(2) {
            return Err(ConfigLoadError::Invalid(format!(
                "orphan timeout ({}ms) must be at least twice the poll \
                 interval ({}ms) or running scans look abandoned",
                watcher.orphan_timeout_ms, watcher.poll_interval_ms
            )));
        }
        if watcher.schedule_window_ms < watcher.poll_interval_ms {
            tracing::warn!(
                schedule_window_ms = watcher.schedule_window_ms,
                poll_interval_ms = watcher.poll_interval_ms,
                "Schedule window is narrower than the poll interval; \
                 scheduled runs may be skipped"
            );
        }
        Ok(())
    }

    /// Backend base URL, normalised to end with `/` so relative resource
    /// paths join beneath it.
    pub fn backend_url(&self) -> Result<Url, ConfigLoadError> {
        base_url("backend", &self.backend.address)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.request_timeout_ms)
    }

    pub fn plugin_config(&self) -> Result<ExternalProviderConfig, ConfigLoadError> {
        let address = self.provider.plugin_address.as_deref().ok_or_else(|| {
            ConfigLoadError::Invalid(
                "the external provider needs VMSCAN_PLUGIN_ADDRESS".into(),
            )
        })?;
        Ok(ExternalProviderConfig {
            address: base_url("plugin", address)?,
            request_timeout: Duration::from_millis(
                self.provider.request_timeout_ms,
            ),
        })
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to render settings")
    }
}

fn base_url(field: &'static str, raw: &str) -> Result<Url, ConfigLoadError> {
    let mut value = raw.trim().to_string();
    if !value.ends_with('/') {
        value.push('/');
    }
    Url::parse(&value).map_err(|source| ConfigLoadError::InvalidUrl {
        field,
        value: raw.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use vmscan_core::config::DeleteJobPolicy;

    use super::*;

    fn lookup(
        vars: &[(&str, &str)],
    ) -> impl Fn(&str) -> Option<String> + use<> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    const PLUGIN: (&str, &str) = ("VMSCAN_PLUGIN_ADDRESS", "http://plugin:8080");

    #[test]
    fn defaults_apply_without_any_input() {
        let load = Settings::load_with(&lookup(&[PLUGIN])).expect("load");

        assert_eq!(load.source, SettingsSource::Default);
        let orchestrator = &load.settings.orchestrator;
        assert_eq!(orchestrator.watcher.poll_interval_ms, 15_000);
        assert_eq!(orchestrator.controller_startup_delay_ms, 15_000);
        assert_eq!(orchestrator.scanner.delete_job_policy, DeleteJobPolicy::Always);
        assert_eq!(
            load.settings.backend_url().expect("url").as_str(),
            "http://localhost:8888/api/"
        );
    }

    #[test]
    fn env_overrides_take_precedence() {
        let load = Settings::load_with(&lookup(&[
            PLUGIN,
            ("VMSCAN_POLL_INTERVAL", "30s"),
            ("VMSCAN_SCAN_TIMEOUT", "2h"),
            ("VMSCAN_MAX_PARALLEL_SCANNERS", "8"),
            ("VMSCAN_DELETE_JOB_POLICY", "OnSuccess"),
            ("VMSCAN_REGION", "eu-central-1"),
            ("VMSCAN_FRESHCLAM_MIRROR", "http://mirror.local"),
        ]))
        .expect("load");

        let orchestrator = &load.settings.orchestrator;
        assert_eq!(orchestrator.watcher.poll_interval_ms, 30_000);
        assert_eq!(orchestrator.scanner.scan_timeout_ms, 2 * 60 * 60 * 1_000);
        assert_eq!(orchestrator.scanner.max_parallel_scanners, 8);
        assert_eq!(
            orchestrator.scanner.delete_job_policy,
            DeleteJobPolicy::OnSuccess
        );
        assert_eq!(orchestrator.placement.region, "eu-central-1");
        assert_eq!(
            orchestrator.tools.alternative_freshclam_mirror_url.as_deref(),
            Some("http://mirror.local")
        );
    }

    #[test]
    fn orphan_timeout_must_outlast_two_heartbeats() {
        let err = Settings::load_with(&lookup(&[
            PLUGIN,
            ("VMSCAN_POLL_INTERVAL", "60s"),
            ("VMSCAN_ORPHAN_TIMEOUT", "90s"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("orphan timeout"), "{err:#}");

        let load = Settings::load_with(&lookup(&[
            PLUGIN,
            ("VMSCAN_ORPHAN_TIMEOUT", "5m"),
        ]))
        .expect("load");
        assert_eq!(load.settings.orchestrator.watcher.orphan_timeout_ms, 300_000);
    }

    #[test]
    fn malformed_env_values_name_the_variable() {
        let err = Settings::load_with(&lookup(&[
            PLUGIN,
            ("VMSCAN_RESULT_TIMEOUT", "eventually"),
        ]))
        .expect_err("invalid duration");

        assert!(err.to_string().contains("VMSCAN_RESULT_TIMEOUT"), "{err}");
    }

    #[test]
    fn external_provider_requires_a_plugin_address() {
        let err = Settings::load_with(&lookup(&[])).expect_err("no plugin");
        assert!(err.to_string().contains("VMSCAN_PLUGIN_ADDRESS"), "{err}");
    }

    #[test]
    fn toml_file_is_layered_under_env() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            file,
            r#"
[backend]
address = "https://backend.internal/api"

[provider]
plugin_address = "http://plugin:9000"

[orchestrator.scanner]
max_parallel_scanners = 4
delete_job_policy = "Never"

[orchestrator.placement]
region = "us-west-2"
"#
        )
        .expect("write config");
        let path = file.path().display().to_string();

        let load = Settings::load_with(&lookup(&[
            ("VMSCAN_CONFIG_PATH", path.as_str()),
            ("VMSCAN_REGION", "ap-south-1"),
        ]))
        .expect("load");

        assert_eq!(load.source, SettingsSource::EnvPath(file.path().into()));
        let settings = &load.settings;
        assert_eq!(settings.backend.address, "https://backend.internal/api");
        assert_eq!(settings.orchestrator.scanner.max_parallel_scanners, 4);
        assert_eq!(
            settings.orchestrator.scanner.delete_job_policy,
            DeleteJobPolicy::Never
        );
        assert_eq!(settings.orchestrator.placement.region, "ap-south-1");
        assert_eq!(
            settings.plugin_config().expect("plugin").address.as_str(),
            "http://plugin:9000/"
        );
    }

    #[test]
    fn inline_json_is_accepted() {
        let load = Settings::load_with(&lookup(&[(
            "VMSCAN_CONFIG_JSON",
            r#"{"provider": {"plugin_address": "http://plugin"},
                "orchestrator": {"watcher": {"schedule_window_ms": 120000}}}"#,
        )]))
        .expect("load");

        assert_eq!(load.source, SettingsSource::EnvInline);
        assert_eq!(load.settings.orchestrator.watcher.schedule_window_ms, 120_000);
    }

    #[test]
    fn rendered_toml_loads_back() {
        let mut settings = Settings::default();
        settings.provider.plugin_address = Some("http://plugin".into());
        settings.orchestrator.placement.availability_zone = Some("us-east-1c".into());

        let rendered = settings.to_toml().expect("render");
        let parsed = Settings::parse_from_str(&rendered, "rendered").expect("parse");

        assert_eq!(parsed, settings);
    }
}
