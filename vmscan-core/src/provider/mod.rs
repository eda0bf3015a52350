//! Cloud provider abstraction.
//!
//! The job lifecycle only ever talks to a [`ProviderClient`]. Each backend
//! (native cloud SDK bindings or the [`external`] plugin) implements the same
//! capability set and reports failures through [`ProviderError`].

pub mod error;
pub mod external;
pub mod retry;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use vmscan_model::{
    InstanceInfo, ScanId, ScanResultId, ScanScope, TargetId,
};

pub use error::{
    BoxError, CloudApiError, FaultKind, ProviderError, ProviderResult,
    classify,
};
pub use retry::{RetryPolicy, WaitError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Aws,
    Azure,
    External,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::Aws => "aws",
            ProviderKind::Azure => "azure",
            ProviderKind::External => "external",
        })
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(ProviderKind::Aws),
            "azure" => Ok(ProviderKind::Azure),
            "external" => Ok(ProviderKind::External),
            other => Err(format!("unknown provider kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    pub region: String,
    pub availability_zone: String,
}

/// A scanner instance launched by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub region: String,
    pub availability_zone: String,
}

/// Everything a provider needs to launch one scanner instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJobConfig {
    pub scan_id: ScanId,
    pub target_id: TargetId,
    pub scan_result_id: ScanResultId,
    pub target: InstanceInfo,
    pub scanner_image: String,
    pub instance_type: String,
    pub region: String,
    pub availability_zone: Option<String>,
    pub block_device_name: String,
    pub backend_address: String,
    /// Serialised scanner CLI bundle, passed through verbatim.
    pub scanner_cli_config: String,
}

/// Capability set of a cloud backend.
///
/// Implementations must be idempotent: "already exists in the desired state"
/// is success. Every error must come back classified.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn discover(
        &self,
        scope: &ScanScope,
    ) -> ProviderResult<Vec<InstanceInfo>>;

    async fn get_instance_root_volume(
        &self,
        instance: &InstanceInfo,
    ) -> ProviderResult<Volume>;

    async fn create_snapshot(&self, volume: &Volume) -> ProviderResult<Snapshot>;

    async fn snapshot_ready(&self, snapshot: &Snapshot) -> ProviderResult<bool>;

    /// Unconditionally copy `snapshot` into `region`. Callers should go
    /// through [`ProviderClient::copy_snapshot`].
    async fn copy_snapshot_to_region(
        &self,
        snapshot: &Snapshot,
        region: &str,
    ) -> ProviderResult<Snapshot>;

    async fn create_volume(
        &self,
        snapshot: &Snapshot,
        availability_zone: &str,
    ) -> ProviderResult<Volume>;

    async fn volume_ready(&self, volume: &Volume) -> ProviderResult<bool>;

    async fn launch_instance(
        &self,
        job: &ScanJobConfig,
    ) -> ProviderResult<Instance>;

    async fn instance_ready(&self, instance: &Instance) -> ProviderResult<bool>;

    async fn attach_volume(
        &self,
        instance: &Instance,
        volume: &Volume,
        device_name: &str,
    ) -> ProviderResult<()>;

    async fn volume_attached(
        &self,
        instance: &Instance,
        volume: &Volume,
    ) -> ProviderResult<bool>;

    async fn delete_instance(&self, instance: &Instance) -> ProviderResult<()>;

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> ProviderResult<()>;

    async fn delete_volume(&self, volume: &Volume) -> ProviderResult<()>;

    /// Copy `snapshot` into `region`, returning it unchanged when it already
    /// lives there.
    async fn copy_snapshot(
        &self,
        snapshot: &Snapshot,
        region: &str,
    ) -> ProviderResult<Snapshot> {
        if snapshot.region == region {
            return Ok(snapshot.clone());
        }
        self.copy_snapshot_to_region(snapshot, region).await
    }

    async fn wait_for_snapshot_ready(
        &self,
        snapshot: &Snapshot,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        retry::wait_until(policy, cancel, || self.snapshot_ready(snapshot))
            .await
    }

    async fn wait_for_volume_ready(
        &self,
        volume: &Volume,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        retry::wait_until(policy, cancel, || self.volume_ready(volume)).await
    }

    async fn wait_for_instance_ready(
        &self,
        instance: &Instance,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        retry::wait_until(policy, cancel, || self.instance_ready(instance))
            .await
    }

    async fn wait_for_volume_attached(
        &self,
        instance: &Instance,
        volume: &Volume,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        retry::wait_until(policy, cancel, || {
            self.volume_attached(instance, volume)
        })
        .await
    }
}
