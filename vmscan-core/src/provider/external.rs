//! Provider backed by an out-of-process plugin.
//!
//! Every trait method maps to `POST {address}/v1/{method}` with a JSON body.
//! The plugin answers with an envelope carrying either a result or an error
//! that is already tagged retryable/fatal.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use url::Url;
use vmscan_model::{InstanceInfo, ScanScope};

use super::error::{PLUGIN_RETRY_AFTER, ProviderError, ProviderResult, classify};
use super::{
    Instance, ProviderClient, ProviderKind, ScanJobConfig, Snapshot, Volume,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalProviderConfig {
    pub address: Url,
    pub request_timeout: Duration,
}

#[derive(Error, Debug)]
#[error("plugin call `{method}` failed: {message}")]
pub struct PluginCallError {
    pub method: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PluginErrorKind {
    None,
    Retryable,
    Fatal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PluginError {
    kind: PluginErrorKind,
    #[serde(default)]
    message: String,
    #[serde(default)]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PluginEnvelope<T> {
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    error: Option<PluginError>,
}

impl<T: DeserializeOwned> PluginEnvelope<T> {
    fn into_result(self, method: &str) -> ProviderResult<T> {
        if let Some(error) = self.error {
            let err = PluginCallError {
                method: method.to_string(),
                message: error.message,
            };
            match error.kind {
                PluginErrorKind::None => {}
                PluginErrorKind::Retryable => {
                    let after = error
                        .retry_after_seconds
                        .map(Duration::from_secs)
                        .unwrap_or(PLUGIN_RETRY_AFTER);
                    return Err(ProviderError::retryable(err, after));
                }
                PluginErrorKind::Fatal => return Err(ProviderError::fatal(err)),
            }
        }

        match self.result {
            Some(value) => Ok(value),
            // Unit-returning calls legitimately omit `result`.
            None => serde_json::from_value(serde_json::Value::Null).map_err(
                |_| {
                    ProviderError::fatal(PluginCallError {
                        method: method.to_string(),
                        message: "response carried no result".to_string(),
                    })
                },
            ),
        }
    }
}

/// [`ProviderClient`] that forwards every call to a remote plugin.
#[derive(Debug, Clone)]
pub struct ExternalProvider {
    client: reqwest::Client,
    base: Url,
}

impl ExternalProvider {
    pub fn new(config: &ExternalProviderConfig) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(ProviderError::fatal)?;

        Ok(Self {
            client,
            base: config.address.clone(),
        })
    }

    async fn call<Req, Resp>(
        &self,
        method: &str,
        body: &Req,
    ) -> ProviderResult<Resp>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let url = self
            .base
            .join(&format!("v1/{method}"))
            .map_err(ProviderError::fatal)?;

        tracing::trace!(target: "vmscan::provider", %url, "plugin call");

        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(classify)?;

        let envelope: PluginEnvelope<Resp> =
            response.json().await.map_err(|err| {
                if err.is_decode() {
                    ProviderError::fatal(err)
                } else {
                    classify(err)
                }
            })?;

        envelope.into_result(method)
    }
}

#[async_trait]
impl ProviderClient for ExternalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::External
    }

    async fn discover(
        &self,
        scope: &ScanScope,
    ) -> ProviderResult<Vec<InstanceInfo>> {
        self.call("discover", &json!({ "scope": scope })).await
    }

    async fn get_instance_root_volume(
        &self,
        instance: &InstanceInfo,
    ) -> ProviderResult<Volume> {
        self.call("getInstanceRootVolume", &json!({ "instance": instance }))
            .await
    }

    async fn create_snapshot(&self, volume: &Volume) -> ProviderResult<Snapshot> {
        self.call("createSnapshot", &json!({ "volume": volume })).await
    }

    async fn snapshot_ready(&self, snapshot: &Snapshot) -> ProviderResult<bool> {
        self.call("snapshotReady", &json!({ "snapshot": snapshot }))
            .await
    }

    async fn copy_snapshot_to_region(
        &self,
        snapshot: &Snapshot,
        region: &str,
    ) -> ProviderResult<Snapshot> {
        self.call(
            "copySnapshot",
            &json!({ "snapshot": snapshot, "region": region }),
        )
        .await
    }

    async fn create_volume(
        &self,
        snapshot: &Snapshot,
        availability_zone: &str,
    ) -> ProviderResult<Volume> {
        self.call(
            "createVolume",
            &json!({
                "snapshot": snapshot,
                "availabilityZone": availability_zone,
            }),
        )
        .await
    }

    async fn volume_ready(&self, volume: &Volume) -> ProviderResult<bool> {
        self.call("volumeReady", &json!({ "volume": volume })).await
    }

    async fn launch_instance(
        &self,
        job: &ScanJobConfig,
    ) -> ProviderResult<Instance> {
        self.call("launchInstance", &json!({ "job": job })).await
    }

    async fn instance_ready(&self, instance: &Instance) -> ProviderResult<bool> {
        self.call("instanceReady", &json!({ "instance": instance }))
            .await
    }

    async fn attach_volume(
        &self,
        instance: &Instance,
        volume: &Volume,
        device_name: &str,
    ) -> ProviderResult<()> {
        self.call(
            "attachVolume",
            &json!({
                "instance": instance,
                "volume": volume,
                "deviceName": device_name,
            }),
        )
        .await
    }

    async fn volume_attached(
        &self,
        instance: &Instance,
        volume: &Volume,
    ) -> ProviderResult<bool> {
        self.call(
            "volumeAttached",
            &json!({ "instance": instance, "volume": volume }),
        )
        .await
    }

    async fn delete_instance(&self, instance: &Instance) -> ProviderResult<()> {
        self.call("deleteInstance", &json!({ "instance": instance }))
            .await
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> ProviderResult<()> {
        self.call("deleteSnapshot", &json!({ "snapshot": snapshot }))
            .await
    }

    async fn delete_volume(&self, volume: &Volume) -> ProviderResult<()> {
        self.call("deleteVolume", &json!({ "volume": volume })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode<T: DeserializeOwned>(raw: &str) -> ProviderResult<T> {
        serde_json::from_str::<PluginEnvelope<T>>(raw)
            .expect("valid envelope")
            .into_result("test")
    }

    #[test]
    fn retryable_plugin_errors_default_to_two_minutes() {
        let err = decode::<Snapshot>(
            r#"{"error":{"kind":"retryable","message":"quota"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.retry_after(), Some(PLUGIN_RETRY_AFTER));
    }

    #[test]
    fn plugin_supplied_retry_hint_is_honoured() {
        let err = decode::<Snapshot>(
            r#"{"error":{"kind":"retryable","message":"busy","retryAfterSeconds":5}}"#,
        )
        .unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn fatal_plugin_errors_are_not_retryable() {
        let err = decode::<bool>(
            r#"{"error":{"kind":"fatal","message":"no such volume"}}"#,
        )
        .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("no such volume"));
    }

    #[test]
    fn unit_calls_may_omit_the_result() {
        decode::<()>(r#"{"error":{"kind":"none"}}"#).expect("unit result");
        decode::<()>("{}").expect("empty envelope");
    }

    #[test]
    fn value_calls_require_a_result() {
        let err = decode::<Snapshot>("{}").unwrap_err();
        assert!(!err.is_retryable());
    }
}
