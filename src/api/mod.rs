pub mod memory;

use crate::errors::{RemoteError, RemoteResult};
use crate::models::{DeviceStatus, ModelSetting, ModelTarget, Page, Table, Tombstone, TrackKey, Watermark};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Wire envelope returned by every remote operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope<T> {
    pub succeeded: bool,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub response: Option<ApiPayload<T>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPayload<T> {
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<T>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
}

impl<T> Default for ApiPayload<T> {
    fn default() -> Self {
        Self {
            results: None,
            after_id: None,
            last_id: None,
            total: None,
            result: None,
        }
    }
}

impl<T> ApiEnvelope<T> {
    pub fn success(payload: ApiPayload<T>) -> Self {
        Self {
            succeeded: true,
            response: Some(payload),
            error: None,
        }
    }

    pub fn failure(error: RemoteError) -> Self {
        Self {
            succeeded: false,
            response: None,
            error: Some(error),
        }
    }

    /// Collapses the envelope into a tagged result. A failed envelope without an
    /// error body still fails.
    pub fn into_result(self) -> RemoteResult<ApiPayload<T>> {
        if !self.succeeded {
            return Err(self
                .error
                .unwrap_or_else(|| RemoteError::new("UNKNOWN", "request failed without an error body")));
        }
        Ok(self.response.unwrap_or_default())
    }
}

impl<T> ApiPayload<T> {
    pub fn results(results: Vec<T>) -> Self {
        Self {
            results: Some(results),
            ..Self::default()
        }
    }

    pub fn result(result: T) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn into_results(self) -> Vec<T> {
        self.results.unwrap_or_default()
    }

    /// Page view; a missing `total` falls back to the number of results.
    pub fn into_page(self) -> Page<T> {
        let results = self.results.unwrap_or_default();
        let total = self.total.unwrap_or(results.len() as u64);
        Page { results, total }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InstallRequest {
    Model(ModelTarget),
    Node { url: String },
    Package { name: String },
}

impl InstallRequest {
    pub fn track_key(&self) -> TrackKey {
        match self {
            Self::Model(target) => target.track_key(),
            Self::Node { url } => TrackKey::node(url.clone()),
            Self::Package { name } => TrackKey::package(name.clone()),
        }
    }
}

/// Request/response contract of the remote service. Transports implement this;
/// the crate only consumes it.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Rows of `table` whose watermark is strictly after `after`, ascending,
    /// at most `take` when given.
    async fn fetch_after(
        &self,
        table: Table,
        after: Option<Watermark>,
        take: Option<u32>,
    ) -> RemoteResult<Vec<serde_json::Value>>;

    async fn list(&self, table: Table, skip: u64, take: u32) -> RemoteResult<Page<serde_json::Value>>;

    async fn fetch_deletions(&self, after_id: i64, take: u32) -> RemoteResult<Vec<Tombstone>>;

    async fn save_entity(&self, table: Table, body: serde_json::Value) -> RemoteResult<serde_json::Value>;

    async fn delete_entity(&self, table: Table, key: &str) -> RemoteResult<()>;

    async fn device_status(&self, device_id: &str) -> RemoteResult<DeviceStatus>;

    async fn install(&self, device_id: &str, request: &InstallRequest) -> RemoteResult<Option<serde_json::Value>>;

    async fn uninstall(&self, device_id: &str, key: &TrackKey) -> RemoteResult<Option<serde_json::Value>>;

    async fn set_model_hidden(&self, device_id: &str, model_path: &str, hidden: bool) -> RemoteResult<()>;

    async fn set_model_settings(
        &self,
        device_id: &str,
        model_path: &str,
        settings: ModelSetting,
    ) -> RemoteResult<()>;
}

#[cfg(test)]
mod tests {
    use super::{ApiEnvelope, ApiPayload};
    use crate::errors::RemoteError;

    #[test]
    fn failed_envelope_surfaces_server_error() {
        let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_str(
            r#"{"succeeded":false,"error":{"errorCode":"FORBIDDEN","message":"not your device"}}"#,
        )
        .expect("parse");
        let err = envelope.into_result().expect_err("should fail");
        assert_eq!(err, RemoteError::new("FORBIDDEN", "not your device"));
    }

    #[test]
    fn failed_envelope_without_body_still_fails() {
        let envelope: ApiEnvelope<serde_json::Value> =
            serde_json::from_str(r#"{"succeeded":false}"#).expect("parse");
        assert_eq!(envelope.into_result().expect_err("fails").code, "UNKNOWN");
    }

    #[test]
    fn successful_envelope_yields_page() {
        let envelope: ApiEnvelope<i64> = serde_json::from_str(
            r#"{"succeeded":true,"response":{"results":[1,2,3],"total":120}}"#,
        )
        .expect("parse");
        let page = envelope.into_result().expect("ok").into_page();
        assert_eq!(page.results, vec![1, 2, 3]);
        assert_eq!(page.total, 120);

        let bare: ApiEnvelope<i64> = serde_json::from_str(r#"{"succeeded":true}"#).expect("parse");
        assert!(bare.into_result().expect("ok").into_results().is_empty());
        assert_eq!(ApiPayload::result(7).result, Some(7));
    }
}
