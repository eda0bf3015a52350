use crate::chrono::{DateTime, Utc};
use crate::ids::ScanConfigId;

/// Key/value pair used for instance tag selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct VpcScope {
    pub id: String,
    pub security_groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct RegionScope {
    pub id: String,
    pub vpcs: Vec<VpcScope>,
}

/// Which instances a scan configuration covers.
///
/// Empty `regions` together with `all_regions = false` selects nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct ScanScope {
    pub all_regions: bool,
    pub regions: Vec<RegionScope>,
    pub scan_stopped_instances: bool,
    /// Instances must carry every one of these tags.
    pub include_tags: Vec<Tag>,
    /// Instances carrying any of these tags are skipped.
    pub exclude_tags: Vec<Tag>,
}

/// Enabled scan families. The orchestrator only forwards these to the
/// scanner bundle; it never interprets findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct ScanFamiliesConfig {
    pub sbom: bool,
    pub vulnerabilities: bool,
    pub secrets: bool,
    pub malware: bool,
    pub rootkits: bool,
    pub misconfigurations: bool,
    pub exploits: bool,
}

impl ScanFamiliesConfig {
    pub fn any_enabled(&self) -> bool {
        self.sbom
            || self.vulnerabilities
            || self.secrets
            || self.malware
            || self.rootkits
            || self.misconfigurations
            || self.exploits
    }
}

/// Declarative cadence for a scan configuration.
///
/// Either field may be absent. When both are set the cron line drives
/// recurrence and `operation_time` is the next pending occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct RuntimeSchedule {
    pub operation_time: Option<DateTime<Utc>>,
    pub cron_line: Option<String>,
}

impl RuntimeSchedule {
    pub fn once(at: DateTime<Utc>) -> Self {
        Self {
            operation_time: Some(at),
            cron_line: None,
        }
    }

    pub fn cron(line: impl Into<String>) -> Self {
        Self {
            operation_time: None,
            cron_line: Some(line.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operation_time.is_none()
            && self
                .cron_line
                .as_deref()
                .is_none_or(|line| line.trim().is_empty())
    }
}

/// A stored, user-authored scan configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ScanConfig {
    pub id: ScanConfigId,
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub scope: ScanScope,
    #[cfg_attr(feature = "serde", serde(default))]
    pub families: ScanFamiliesConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub scheduled: Option<RuntimeSchedule>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub disabled: bool,
    /// Overrides the engine-wide worker pool size for scans of this config.
    #[cfg_attr(feature = "serde", serde(default))]
    pub max_parallel_scanners: Option<u32>,
    /// Overrides the engine-wide scan timeout for scans of this config.
    #[cfg_attr(feature = "serde", serde(default))]
    pub timeout_seconds: Option<u64>,
}

impl ScanConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ScanConfigId::new(),
            name: name.into(),
            scope: ScanScope::default(),
            families: ScanFamiliesConfig::default(),
            scheduled: None,
            disabled: false,
            max_parallel_scanners: None,
            timeout_seconds: None,
        }
    }

    pub fn with_schedule(mut self, schedule: RuntimeSchedule) -> Self {
        self.scheduled = Some(schedule);
        self
    }

    pub fn with_scope(mut self, scope: ScanScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_max_parallel_scanners(mut self, max: u32) -> Self {
        self.max_parallel_scanners = Some(max);
        self
    }

    pub fn cron_line(&self) -> Option<&str> {
        self.scheduled
            .as_ref()
            .and_then(|s| s.cron_line.as_deref())
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }

    pub fn operation_time(&self) -> Option<DateTime<Utc>> {
        self.scheduled.as_ref().and_then(|s| s.operation_time)
    }
}

/// Sparse update the orchestrator applies after evaluating a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ScanConfigPatch {
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub scheduled: Option<RuntimeSchedule>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub disabled: Option<bool>,
}

impl ScanConfigPatch {
    pub fn disable() -> Self {
        Self {
            scheduled: None,
            disabled: Some(true),
        }
    }

    pub fn reschedule(schedule: RuntimeSchedule) -> Self {
        Self {
            scheduled: Some(schedule),
            disabled: None,
        }
    }
}
