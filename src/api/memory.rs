//! In-process implementation of [`RemoteApi`], used by tests and offline demos.
//!
//! Collections keep server order. Install and uninstall calls are recorded as
//! pending device work and only become visible in the device snapshot after
//! [`InMemoryApi::settle_device`], mirroring a slow remote worker.

use super::{ApiEnvelope, ApiPayload, InstallRequest, RemoteApi};
use crate::errors::{RemoteError, RemoteResult};
use crate::models::{
    DeviceSnapshot, DeviceStatus, ModelSetting, Page, Table, Tombstone, TrackKey, Watermark, WatermarkKind,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOperation {
    FetchAfter,
    List,
    FetchDeletions,
    SaveEntity,
    DeleteEntity,
    DeviceStatus,
    Install,
    Uninstall,
    UpdateModel,
}

#[derive(Debug, Clone)]
enum PendingWork {
    Install(InstallRequest),
    Uninstall(TrackKey),
}

#[derive(Default)]
struct State {
    tables: BTreeMap<Table, Vec<serde_json::Value>>,
    tombstones: Vec<Tombstone>,
    next_tombstone_id: i64,
    devices: HashMap<String, DeviceStatus>,
    pending: HashMap<String, Vec<PendingWork>>,
    failures: HashMap<ApiOperation, RemoteError>,
    stale_tables: HashSet<Table>,
    calls: Vec<(ApiOperation, Instant)>,
}

#[derive(Default)]
pub struct InMemoryApi {
    state: Mutex<State>,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Runs one operation through the wire envelope so failures take the same
    /// path a transport's would.
    fn respond<T>(
        &self,
        operation: ApiOperation,
        handler: impl FnOnce(&mut State) -> ApiEnvelope<T>,
    ) -> RemoteResult<ApiPayload<T>> {
        let envelope = self.with_state(|state| {
            state.calls.push((operation, Instant::now()));
            if let Some(error) = state.failures.get(&operation).cloned() {
                return ApiEnvelope::failure(error);
            }
            handler(state)
        });
        envelope.into_result()
    }

    pub fn insert_row(&self, table: Table, row: serde_json::Value) {
        self.with_state(|state| upsert_row(state.tables.entry(table).or_default(), row));
    }

    pub fn insert_rows(&self, table: Table, rows: impl IntoIterator<Item = serde_json::Value>) {
        for row in rows {
            self.insert_row(table, row);
        }
    }

    /// Deletes a row server-side and emits the matching tombstone.
    pub fn remove_row(&self, table: Table, key: &str) -> Tombstone {
        self.with_state(|state| remove_row(state, table, key))
    }

    /// Emits a tombstone for an arbitrary server table name.
    pub fn push_tombstone(&self, table_name: &str, key: &str) -> Tombstone {
        self.with_state(|state| push_tombstone(state, table_name, key))
    }

    pub fn rows(&self, table: Table) -> Vec<serde_json::Value> {
        self.with_state(|state| state.tables.get(&table).cloned().unwrap_or_default())
    }

    pub fn set_device(&self, snapshot: DeviceSnapshot) {
        self.with_state(|state| {
            let entry = state
                .devices
                .entry(snapshot.device_id.clone())
                .or_insert_with(|| DeviceStatus {
                    device: DeviceSnapshot::default(),
                    status: None,
                    error: None,
                });
            entry.device = snapshot;
        });
    }

    pub fn set_device_report(&self, device_id: &str, status: Option<String>, error: Option<RemoteError>) {
        self.with_state(|state| {
            if let Some(entry) = state.devices.get_mut(device_id) {
                entry.status = status;
                entry.error = error;
            }
        });
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.with_state(|state| state.devices.get(device_id).map(|entry| entry.device.clone()))
    }

    /// Applies all pending install and uninstall work to the device snapshot.
    pub fn settle_device(&self, device_id: &str) {
        self.with_state(|state| {
            let pending = state.pending.remove(device_id).unwrap_or_default();
            let Some(entry) = state.devices.get_mut(device_id) else {
                return;
            };
            for work in pending {
                apply_work(&mut entry.device, work);
            }
            entry.device.last_update = Some(chrono::Utc::now());
        });
    }

    pub fn fail(&self, operation: ApiOperation, error: RemoteError) {
        self.with_state(|state| {
            state.failures.insert(operation, error);
        });
    }

    pub fn recover(&self, operation: ApiOperation) {
        self.with_state(|state| {
            state.failures.remove(&operation);
        });
    }

    /// Makes `fetch_after` ignore the watermark for `table` and keep returning
    /// the first page.
    pub fn echo_stale_pages(&self, table: Table) {
        self.with_state(|state| {
            state.stale_tables.insert(table);
        });
    }

    pub fn call_count(&self, operation: ApiOperation) -> usize {
        self.with_state(|state| state.calls.iter().filter(|(call, _)| *call == operation).count())
    }

    /// When each call to `operation` arrived, on the tokio clock.
    pub fn call_times(&self, operation: ApiOperation) -> Vec<Instant> {
        self.with_state(|state| {
            state
                .calls
                .iter()
                .filter(|(call, _)| *call == operation)
                .map(|(_, at)| *at)
                .collect()
        })
    }

    pub fn reset_calls(&self) {
        self.with_state(|state| state.calls.clear());
    }
}

#[async_trait]
impl RemoteApi for InMemoryApi {
    async fn fetch_after(
        &self,
        table: Table,
        after: Option<Watermark>,
        take: Option<u32>,
    ) -> RemoteResult<Vec<serde_json::Value>> {
        self.respond(ApiOperation::FetchAfter, |state| {
            let stale = state.stale_tables.contains(&table);
            let mut rows = state
                .tables
                .get(&table)
                .map(|rows| {
                    rows.iter()
                        .filter(|row| stale || is_after(table, row, after.as_ref()))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            rows.sort_by(|left, right| compare_watermarks(table, left, right));
            if let Some(take) = take {
                rows.truncate(take as usize);
            }
            ApiEnvelope::success(ApiPayload::results(rows))
        })
        .map(ApiPayload::into_results)
    }

    async fn list(&self, table: Table, skip: u64, take: u32) -> RemoteResult<Page<serde_json::Value>> {
        self.respond(ApiOperation::List, |state| {
            let rows = state.tables.get(&table).cloned().unwrap_or_default();
            let total = rows.len() as u64;
            let results = rows
                .into_iter()
                .skip(skip as usize)
                .take(take as usize)
                .collect::<Vec<_>>();
            ApiEnvelope::success(ApiPayload {
                total: Some(total),
                ..ApiPayload::results(results)
            })
        })
        .map(ApiPayload::into_page)
    }

    async fn fetch_deletions(&self, after_id: i64, take: u32) -> RemoteResult<Vec<Tombstone>> {
        self.respond(ApiOperation::FetchDeletions, |state| {
            let mut tombstones = state
                .tombstones
                .iter()
                .filter(|tombstone| tombstone.id > after_id)
                .cloned()
                .collect::<Vec<_>>();
            tombstones.sort_by_key(|tombstone| tombstone.id);
            tombstones.truncate(take as usize);
            let after_id = tombstones.last().map(|tombstone| tombstone.id);
            ApiEnvelope::success(ApiPayload {
                after_id,
                ..ApiPayload::results(tombstones)
            })
        })
        .map(ApiPayload::into_results)
    }

    async fn save_entity(&self, table: Table, body: serde_json::Value) -> RemoteResult<serde_json::Value> {
        self.respond(ApiOperation::SaveEntity, |state| {
            if row_key(&body).is_none() {
                return ApiEnvelope::failure(RemoteError::new("INVALID_ENTITY", "entity has no id"));
            }
            upsert_row(state.tables.entry(table).or_default(), body.clone());
            ApiEnvelope::success(ApiPayload::result(body))
        })
        .and_then(|payload| {
            payload
                .result
                .ok_or_else(|| RemoteError::new("EMPTY_RESULT", "save returned no entity"))
        })
    }

    async fn delete_entity(&self, table: Table, key: &str) -> RemoteResult<()> {
        self.respond(ApiOperation::DeleteEntity, |state| {
            let exists = state
                .tables
                .get(&table)
                .map(|rows| rows.iter().any(|row| row_key(row).as_deref() == Some(key)))
                .unwrap_or(false);
            if !exists {
                return ApiEnvelope::failure(RemoteError::new("NOT_FOUND", format!("{} {} not found", table, key)));
            }
            remove_row(state, table, key);
            ApiEnvelope::<()>::success(ApiPayload::default())
        })
        .map(|_| ())
    }

    async fn device_status(&self, device_id: &str) -> RemoteResult<DeviceStatus> {
        self.respond(ApiOperation::DeviceStatus, |state| match state.devices.get(device_id) {
            Some(status) => ApiEnvelope::success(ApiPayload::result(status.clone())),
            None => ApiEnvelope::failure(device_not_found(device_id)),
        })
        .and_then(|payload| payload.result.ok_or_else(|| device_not_found(device_id)))
    }

    async fn install(&self, device_id: &str, request: &InstallRequest) -> RemoteResult<Option<serde_json::Value>> {
        self.respond(ApiOperation::Install, |state| {
            if !state.devices.contains_key(device_id) {
                return ApiEnvelope::failure(device_not_found(device_id));
            }
            state
                .pending
                .entry(device_id.to_string())
                .or_default()
                .push(PendingWork::Install(request.clone()));
            ApiEnvelope::success(ApiPayload::result(serde_json::json!({ "queued": true })))
        })
        .map(|payload| payload.result)
    }

    async fn uninstall(&self, device_id: &str, key: &TrackKey) -> RemoteResult<Option<serde_json::Value>> {
        self.respond(ApiOperation::Uninstall, |state| {
            if !state.devices.contains_key(device_id) {
                return ApiEnvelope::failure(device_not_found(device_id));
            }
            state
                .pending
                .entry(device_id.to_string())
                .or_default()
                .push(PendingWork::Uninstall(key.clone()));
            ApiEnvelope::success(ApiPayload::result(serde_json::json!({ "queued": true })))
        })
        .map(|payload| payload.result)
    }

    async fn set_model_hidden(&self, device_id: &str, model_path: &str, hidden: bool) -> RemoteResult<()> {
        self.respond(ApiOperation::UpdateModel, |state| {
            let Some(entry) = state.devices.get_mut(device_id) else {
                return ApiEnvelope::failure(device_not_found(device_id));
            };
            let hidden_models = &mut entry.device.hidden_models;
            hidden_models.retain(|path| path != model_path);
            if hidden {
                hidden_models.push(model_path.to_string());
            }
            ApiEnvelope::<()>::success(ApiPayload::default())
        })
        .map(|_| ())
    }

    async fn set_model_settings(
        &self,
        device_id: &str,
        model_path: &str,
        settings: ModelSetting,
    ) -> RemoteResult<()> {
        self.respond(ApiOperation::UpdateModel, |state| {
            let Some(entry) = state.devices.get_mut(device_id) else {
                return ApiEnvelope::failure(device_not_found(device_id));
            };
            entry
                .device
                .model_settings
                .insert(model_path.to_string(), settings);
            ApiEnvelope::<()>::success(ApiPayload::default())
        })
        .map(|_| ())
    }
}

fn device_not_found(device_id: &str) -> RemoteError {
    RemoteError::new("DEVICE_NOT_FOUND", format!("device {} is not registered", device_id))
}

fn row_key(row: &serde_json::Value) -> Option<String> {
    match row.get("id")? {
        serde_json::Value::String(id) => Some(id.clone()),
        serde_json::Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn row_watermark(table: Table, row: &serde_json::Value) -> Option<Watermark> {
    match table.watermark_kind() {
        WatermarkKind::ModifiedDate => row
            .get("modifiedDate")
            .and_then(serde_json::Value::as_str)
            .map(|date| Watermark::ModifiedDate(date.to_string())),
        WatermarkKind::Id => row.get("id").and_then(serde_json::Value::as_i64).map(Watermark::Id),
    }
}

fn is_after(table: Table, row: &serde_json::Value, after: Option<&Watermark>) -> bool {
    let Some(after) = after else {
        return true;
    };
    match (row_watermark(table, row), after) {
        (Some(Watermark::ModifiedDate(date)), Watermark::ModifiedDate(after)) => date.as_str() > after.as_str(),
        (Some(Watermark::Id(id)), Watermark::Id(after)) => id > *after,
        _ => false,
    }
}

fn compare_watermarks(table: Table, left: &serde_json::Value, right: &serde_json::Value) -> std::cmp::Ordering {
    match (row_watermark(table, left), row_watermark(table, right)) {
        (Some(Watermark::ModifiedDate(a)), Some(Watermark::ModifiedDate(b))) => a.cmp(&b),
        (Some(Watermark::Id(a)), Some(Watermark::Id(b))) => a.cmp(&b),
        _ => std::cmp::Ordering::Equal,
    }
}

fn upsert_row(rows: &mut Vec<serde_json::Value>, row: serde_json::Value) {
    let key = row_key(&row);
    match rows.iter_mut().find(|existing| key.is_some() && row_key(existing) == key) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

fn remove_row(state: &mut State, table: Table, key: &str) -> Tombstone {
    if let Some(rows) = state.tables.get_mut(&table) {
        rows.retain(|row| row_key(row).as_deref() != Some(key));
    }
    push_tombstone(state, server_table_name(table), key)
}

fn push_tombstone(state: &mut State, table_name: &str, key: &str) -> Tombstone {
    state.next_tombstone_id += 1;
    let tombstone = Tombstone {
        id: state.next_tombstone_id,
        table_name: table_name.to_string(),
        key: key.to_string(),
    };
    state.tombstones.push(tombstone.clone());
    tombstone
}

fn server_table_name(table: Table) -> &'static str {
    match table {
        Table::Workflows => "Workflow",
        Table::WorkflowVersions => "WorkflowVersion",
        Table::Artifacts => "Artifact",
        Table::Assets => "Asset",
        Table::Generations => "Generation",
        Table::Threads => "Thread",
        Table::WorkflowReactions => "WorkflowReaction",
        Table::ArtifactReactions => "ArtifactReaction",
    }
}

fn apply_work(device: &mut DeviceSnapshot, work: PendingWork) {
    match work {
        PendingWork::Install(InstallRequest::Model(target)) => {
            let files = device.models.entry(target.save_path).or_default();
            if !files.contains(&target.file_name) {
                files.push(target.file_name);
            }
        }
        PendingWork::Install(InstallRequest::Node { url }) => {
            if !device.installed_nodes.contains(&url) {
                device.installed_nodes.push(url);
            }
        }
        PendingWork::Install(InstallRequest::Package { name }) => {
            if !device.installed_pip.contains(&name) {
                device.installed_pip.push(name);
            }
        }
        PendingWork::Uninstall(TrackKey::Model { save_path, file_name }) => {
            if let Some(files) = device.models.get_mut(&save_path) {
                files.retain(|file| file != &file_name);
            }
        }
        PendingWork::Uninstall(TrackKey::Node { url }) => device.installed_nodes.retain(|node| node != &url),
        PendingWork::Uninstall(TrackKey::Package { name }) => device.installed_pip.retain(|pip| pip != &name),
    }
}

#[cfg(test)]
mod tests {
    use super::{ApiOperation, InMemoryApi};
    use crate::api::RemoteApi;
    use crate::errors::RemoteError;
    use crate::models::{Table, Watermark};

    #[tokio::test]
    async fn fetch_after_is_strict_and_ordered() {
        let api = InMemoryApi::new();
        api.insert_rows(
            Table::Threads,
            ["2026-01-03", "2026-01-01", "2026-01-02"]
                .iter()
                .enumerate()
                .map(|(i, date)| serde_json::json!({ "id": format!("t{}", i), "modifiedDate": date })),
        );

        let rows = api
            .fetch_after(Table::Threads, Some(Watermark::ModifiedDate("2026-01-01".to_string())), None)
            .await
            .expect("fetch");
        let dates = rows
            .iter()
            .map(|row| row["modifiedDate"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(dates, vec!["2026-01-02", "2026-01-03"]);
    }

    #[tokio::test]
    async fn injected_failures_travel_through_envelope() {
        let api = InMemoryApi::new();
        api.fail(ApiOperation::List, RemoteError::new("BOOM", "list failed"));
        let err = api.list(Table::Assets, 0, 10).await.expect_err("should fail");
        assert_eq!(err.code, "BOOM");
        api.recover(ApiOperation::List);
        assert!(api.list(Table::Assets, 0, 10).await.is_ok());
        assert_eq!(api.call_count(ApiOperation::List), 2);
    }

    #[tokio::test]
    async fn deleting_an_entity_emits_tombstone() {
        let api = InMemoryApi::new();
        api.insert_row(Table::Assets, serde_json::json!({ "id": "a1", "modifiedDate": "x" }));
        api.delete_entity(Table::Assets, "a1").await.expect("delete");
        let tombstones = api.fetch_deletions(0, 10).await.expect("deletions");
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].table_name, "Asset");
        assert!(api.rows(Table::Assets).is_empty());
        assert!(api.delete_entity(Table::Assets, "a1").await.is_err());
    }
}
