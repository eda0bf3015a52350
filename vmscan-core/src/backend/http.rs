use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use url::Url;
use vmscan_model::{
    InstanceInfo, NewScan, NewScanResult, Page, Scan, ScanConfig,
    ScanConfigId, ScanConfigPatch, ScanId, ScanPatch, ScanResult,
    ScanResultId, ScanResultStatus, Target,
};

use super::{BackendClient, BackendError, ScanConfigQuery};

/// Body of a `409 Conflict` answer: the record that already exists.
#[derive(Debug, Deserialize)]
struct Conflict<T> {
    existing: T,
}

/// [`BackendClient`] speaking REST/JSON with OData-style query options.
#[derive(Debug, Clone)]
pub struct HttpBackendClient {
    client: reqwest::Client,
    base: Url,
}

impl HttpBackendClient {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    fn request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<RequestBuilder, BackendError> {
        let url = self.base.join(path)?;
        Ok(self.client.request(method, url))
    }

    async fn read<T: DeserializeOwned>(
        response: Response,
        kind: &'static str,
        id: impl ToString,
    ) -> Result<T, BackendError> {
        let response = Self::check(response, kind, id).await?;
        Ok(response.json().await?)
    }

    async fn check(
        response: Response,
        kind: &'static str,
        id: impl ToString,
    ) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound {
                kind,
                id: id.to_string(),
            });
        }
        let message = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn list_scan_configs(
        &self,
        query: ScanConfigQuery,
    ) -> Result<Page<ScanConfig>, BackendError> {
        let skip = query.page.saturating_sub(1) * query.page_size;
        let mut params = vec![
            ("$count", "true".to_string()),
            ("$top", query.page_size.to_string()),
            ("$skip", skip.to_string()),
        ];
        if query.enabled_only {
            params.push(("$filter", "disabled eq false".to_string()));
        }

        let response = self
            .request(Method::GET, "scanConfigs")?
            .query(&params)
            .send()
            .await?;
        Self::read(response, "scanConfigs", "list").await
    }

    async fn patch_scan_config(
        &self,
        id: ScanConfigId,
        patch: &ScanConfigPatch,
    ) -> Result<(), BackendError> {
        let response = self
            .request(Method::PATCH, &format!("scanConfigs/{id}"))?
            .json(patch)
            .send()
            .await?;
        Self::check(response, "scanConfig", id).await.map(drop)
    }

    async fn list_active_scans(
        &self,
        config_id: ScanConfigId,
    ) -> Result<Vec<Scan>, BackendError> {
        let filter = format!(
            "scanConfig/id eq '{config_id}' and state ne 'Done' and state ne 'Failed'"
        );
        let response = self
            .request(Method::GET, "scans")?
            .query(&[("$filter", filter)])
            .send()
            .await?;
        let page: Page<Scan> = Self::read(response, "scans", config_id).await?;
        Ok(page.items)
    }

    async fn list_unfinished_scans(&self) -> Result<Vec<Scan>, BackendError> {
        let response = self
            .request(Method::GET, "scans")?
            .query(&[("$filter", "state ne 'Done' and state ne 'Failed'")])
            .send()
            .await?;
        let page: Page<Scan> = Self::read(response, "scans", "unfinished").await?;
        Ok(page.items)
    }

    async fn get_scan(&self, id: ScanId) -> Result<Scan, BackendError> {
        let response = self
            .request(Method::GET, &format!("scans/{id}"))?
            .send()
            .await?;
        Self::read(response, "scan", id).await
    }

    async fn create_scan(&self, scan: &NewScan) -> Result<Scan, BackendError> {
        let response = self
            .request(Method::POST, "scans")?
            .json(scan)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let conflict: Conflict<Scan> = response.json().await?;
            return Err(BackendError::ScanConflict {
                existing: conflict.existing.id,
            });
        }
        Self::read(response, "scans", scan.scan_config_id).await
    }

    async fn patch_scan(
        &self,
        id: ScanId,
        patch: &ScanPatch,
    ) -> Result<(), BackendError> {
        let response = self
            .request(Method::PATCH, &format!("scans/{id}"))?
            .json(patch)
            .send()
            .await?;
        Self::check(response, "scan", id).await.map(drop)
    }

    async fn create_or_get_target(
        &self,
        instance: &InstanceInfo,
    ) -> Result<Target, BackendError> {
        let response = self
            .request(Method::POST, "targets")?
            .json(&json!({ "instance": instance }))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let conflict: Conflict<Target> = response.json().await?;
            return Ok(conflict.existing);
        }
        Self::read(response, "targets", instance.location()).await
    }

    async fn create_scan_result(
        &self,
        result: &NewScanResult,
    ) -> Result<ScanResultId, BackendError> {
        let response = self
            .request(Method::POST, "scanResults")?
            .json(result)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let conflict: Conflict<ScanResult> = response.json().await?;
            return Ok(conflict.existing.id);
        }
        let created: ScanResult =
            Self::read(response, "scanResults", result.target_id).await?;
        Ok(created.id)
    }

    async fn get_scan_result_status(
        &self,
        id: ScanResultId,
    ) -> Result<ScanResultStatus, BackendError> {
        let response = self
            .request(Method::GET, &format!("scanResults/{id}"))?
            .query(&[("$select", "status")])
            .send()
            .await?;
        let result: serde_json::Value =
            Self::read(response, "scanResult", id).await?;
        let status = result.get("status").cloned().ok_or_else(|| {
            BackendError::InvalidResponse(format!(
                "scan result {id} has no status"
            ))
        })?;
        serde_json::from_value(status).map_err(|err| {
            BackendError::InvalidResponse(format!(
                "scan result {id} status is malformed: {err}"
            ))
        })
    }

    async fn patch_scan_result_status(
        &self,
        id: ScanResultId,
        status: &ScanResultStatus,
    ) -> Result<(), BackendError> {
        let response = self
            .request(Method::PATCH, &format!("scanResults/{id}"))?
            .json(&json!({ "status": status }))
            .send()
            .await?;
        Self::check(response, "scanResult", id).await.map(drop)
    }
}
