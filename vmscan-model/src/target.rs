use crate::chrono::{DateTime, Utc};
use crate::ids::TargetId;
use crate::scan_config::Tag;

/// Cloud identity of a discovered virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct InstanceInfo {
    pub instance_id: String,
    pub region: String,
    pub availability_zone: String,
    pub vpc_id: Option<String>,
    pub security_groups: Vec<String>,
    pub image: Option<String>,
    pub platform: Option<String>,
    pub tags: Vec<Tag>,
    pub launch_time: Option<DateTime<Utc>>,
}

impl InstanceInfo {
    pub fn new(
        instance_id: impl Into<String>,
        region: impl Into<String>,
        availability_zone: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            region: region.into(),
            availability_zone: availability_zone.into(),
            ..Self::default()
        }
    }

    /// Key used to deduplicate discovered instances within a scan.
    pub fn identity(&self) -> (&str, &str) {
        (&self.instance_id, &self.region)
    }

    /// `region/instance-id`, the location string used in logs.
    pub fn location(&self) -> String {
        format!("{}/{}", self.region, self.instance_id)
    }
}

/// Stored target record. Created once per unique instance and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Target {
    pub id: TargetId,
    pub instance: InstanceInfo,
}

/// A target resolved for a particular scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInstance {
    pub target_id: TargetId,
    pub instance: InstanceInfo,
}

impl From<Target> for TargetInstance {
    fn from(target: Target) -> Self {
        Self {
            target_id: target.id,
            instance: target.instance,
        }
    }
}
