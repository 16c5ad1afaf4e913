//! Connect-style JSON-over-HTTP client for provider workers.
//!
//! Every method POSTs a JSON body to
//! `<endpoint>/virtrigaud.provider.v1.ProviderService/<Method>` and decodes
//! a JSON response. Errors travel as an envelope
//! `{"error": {"kind": "...", "message": "..."}}` so the caller can
//! reconstruct the error kind.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::client::ProviderRpc;
use crate::error::{ProviderError, Result};
use crate::types::*;

const SERVICE_PATH: &str = "virtrigaud.provider.v1.ProviderService";

/// Default per-request timeout; the worker applies per-operation timeouts
/// of its own.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// HTTP client for one provider worker endpoint.
pub struct HttpProviderClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProviderClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}/{}", self.endpoint, SERVICE_PATH, method)
    }

    #[instrument(skip(self, request), fields(endpoint = %self.endpoint, method = %method))]
    async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.method_url(method);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ProviderError::Unavailable(format!("{}: {}", self.endpoint, e))
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !status.is_success() {
            // Prefer the structured envelope; fall back to status mapping.
            if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
                return Err(ProviderError::from_kind(
                    &envelope.error.kind,
                    envelope.error.message,
                ));
            }
            return Err(match status.as_u16() {
                404 => ProviderError::NotFound(format!("{method}: {status}")),
                429 => ProviderError::RateLimited(format!("{method}: {status}")),
                502 | 503 | 504 => ProviderError::Unavailable(format!("{method}: {status}")),
                _ => ProviderError::Internal(format!("{method}: {status} {body}")),
            });
        }

        debug!(method, "provider RPC completed");
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::Internal(format!("{method}: bad response: {e}")))
    }
}

#[async_trait::async_trait]
impl ProviderRpc for HttpProviderClient {
    async fn validate(&self) -> Result<()> {
        let _: serde_json::Value = self.call("Validate", &json!({})).await?;
        Ok(())
    }

    async fn capabilities(&self) -> Result<ProviderCapabilities> {
        self.call("GetCapabilities", &json!({})).await
    }

    async fn create(&self, req: CreateRequest) -> Result<CreateResponse> {
        self.call("Create", &req).await
    }

    async fn delete(&self, vm_id: &str) -> Result<Option<TaskRef>> {
        let resp: TaskOnly = self.call("Delete", &json!({ "id": vm_id })).await?;
        Ok(resp.task)
    }

    async fn power(&self, vm_id: &str, op: PowerOp) -> Result<Option<TaskRef>> {
        let resp: TaskOnly = self.call("Power", &json!({ "id": vm_id, "op": op })).await?;
        Ok(resp.task)
    }

    async fn reconfigure(&self, vm_id: &str, req: ReconfigureRequest) -> Result<Option<TaskRef>> {
        let resp: TaskOnly = self
            .call("Reconfigure", &json!({ "id": vm_id, "spec": req }))
            .await?;
        Ok(resp.task)
    }

    async fn describe(&self, vm_id: &str) -> Result<DescribeResponse> {
        self.call("Describe", &json!({ "id": vm_id })).await
    }

    async fn task_status(&self, task: &TaskRef) -> Result<TaskStatusInfo> {
        self.call("TaskStatus", &json!({ "task": task })).await
    }

    async fn snapshot_create(&self, req: SnapshotCreateRequest) -> Result<SnapshotCreateResponse> {
        self.call("SnapshotCreate", &req).await
    }

    async fn snapshot_delete(&self, vm_id: &str, snapshot_id: &str) -> Result<Option<TaskRef>> {
        let resp: TaskOnly = self
            .call("SnapshotDelete", &json!({ "id": vm_id, "snapshotId": snapshot_id }))
            .await?;
        Ok(resp.task)
    }

    async fn snapshot_revert(&self, vm_id: &str, snapshot_id: &str) -> Result<Option<TaskRef>> {
        let resp: TaskOnly = self
            .call("SnapshotRevert", &json!({ "id": vm_id, "snapshotId": snapshot_id }))
            .await?;
        Ok(resp.task)
    }

    async fn clone_vm(&self, req: CloneRequest) -> Result<CloneResponse> {
        self.call("Clone", &req).await
    }

    async fn image_prepare(&self, req: ImagePrepareRequest) -> Result<ImagePrepareResponse> {
        self.call("ImagePrepare", &req).await
    }

    async fn export_disk(&self, req: ExportDiskRequest) -> Result<ExportDiskResponse> {
        self.call("ExportDisk", &req).await
    }

    async fn import_disk(&self, req: ImportDiskRequest) -> Result<ImportDiskResponse> {
        self.call("ImportDisk", &req).await
    }

    async fn list_vms(&self) -> Result<Vec<DiscoveredVm>> {
        let resp: ListVmsResponse = self.call("ListVMs", &json!({})).await?;
        Ok(resp.vms)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TaskOnly {
    task: Option<TaskRef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListVmsResponse {
    vms: Vec<DiscoveredVm>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_url() {
        let client = HttpProviderClient::new("http://worker:9090/").unwrap();
        assert_eq!(
            client.method_url("Create"),
            "http://worker:9090/virtrigaud.provider.v1.ProviderService/Create"
        );
    }
}
