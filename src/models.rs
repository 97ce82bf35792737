use crate::errors::RemoteError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseScope {
    App,
    User,
}

impl DatabaseScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkKind {
    ModifiedDate,
    Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Workflows,
    WorkflowVersions,
    Artifacts,
    Assets,
    Generations,
    Threads,
    WorkflowReactions,
    ArtifactReactions,
}

impl Table {
    pub const ALL: [Table; 8] = [
        Table::Workflows,
        Table::WorkflowVersions,
        Table::Artifacts,
        Table::Assets,
        Table::Generations,
        Table::Threads,
        Table::WorkflowReactions,
        Table::ArtifactReactions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workflows => "workflows",
            Self::WorkflowVersions => "workflow_versions",
            Self::Artifacts => "artifacts",
            Self::Assets => "assets",
            Self::Generations => "generations",
            Self::Threads => "threads",
            Self::WorkflowReactions => "workflow_reactions",
            Self::ArtifactReactions => "artifact_reactions",
        }
    }

    pub fn scope(self) -> DatabaseScope {
        match self {
            Self::Workflows | Self::WorkflowVersions | Self::Artifacts | Self::Assets => DatabaseScope::App,
            Self::Generations | Self::Threads | Self::WorkflowReactions | Self::ArtifactReactions => {
                DatabaseScope::User
            }
        }
    }

    pub fn watermark_kind(self) -> WatermarkKind {
        match self {
            Self::WorkflowReactions | Self::ArtifactReactions => WatermarkKind::Id,
            _ => WatermarkKind::ModifiedDate,
        }
    }

    pub fn tables_in(scope: DatabaseScope) -> impl Iterator<Item = Table> {
        Self::ALL.into_iter().filter(move |table| table.scope() == scope)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Highest value already absorbed from a remote collection.
///
/// `ModifiedDate` compares lexically (ISO-8601 strings), `Id` numerically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Watermark {
    Id(i64),
    ModifiedDate(String),
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::ModifiedDate(date) => f.write_str(date),
        }
    }
}

/// A row of one synced table. The primary key, watermark and optional parent key
/// are what the store indexes; everything else is opaque payload.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: Table;

    fn key(&self) -> String;

    fn watermark(&self) -> Watermark;

    fn parent_key(&self) -> Option<&str> {
        None
    }
}

type Extra = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub modified_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Record for Workflow {
    const TABLE: Table = Table::Workflows;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn watermark(&self) -> Watermark {
        Watermark::ModifiedDate(self.modified_date.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersion {
    pub id: String,
    pub parent_id: String,
    pub modified_date: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Record for WorkflowVersion {
    const TABLE: Table = Table::WorkflowVersions;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn watermark(&self) -> Watermark {
        Watermark::ModifiedDate(self.modified_date.clone())
    }

    fn parent_key(&self) -> Option<&str> {
        Some(&self.parent_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub modified_date: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Record for Artifact {
    const TABLE: Table = Table::Artifacts;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn watermark(&self) -> Watermark {
        Watermark::ModifiedDate(self.modified_date.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub modified_date: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Record for Asset {
    const TABLE: Table = Table::Assets;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn watermark(&self) -> Watermark {
        Watermark::ModifiedDate(self.modified_date.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    pub id: String,
    pub thread_id: String,
    pub created_date: String,
    pub modified_date: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Record for Generation {
    const TABLE: Table = Table::Generations;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn watermark(&self) -> Watermark {
        Watermark::ModifiedDate(self.modified_date.clone())
    }

    fn parent_key(&self) -> Option<&str> {
        Some(&self.thread_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub modified_date: String,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Record for Thread {
    const TABLE: Table = Table::Threads;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn watermark(&self) -> Watermark {
        Watermark::ModifiedDate(self.modified_date.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: i64,
    pub entity_id: String,
    pub reaction: String,
}

pub trait ReactionRecord: Record {
    fn reaction(&self) -> &Reaction;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowReaction(pub Reaction);

impl Record for WorkflowReaction {
    const TABLE: Table = Table::WorkflowReactions;

    fn key(&self) -> String {
        self.0.id.to_string()
    }

    fn watermark(&self) -> Watermark {
        Watermark::Id(self.0.id)
    }

    fn parent_key(&self) -> Option<&str> {
        Some(&self.0.entity_id)
    }
}

impl ReactionRecord for WorkflowReaction {
    fn reaction(&self) -> &Reaction {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactReaction(pub Reaction);

impl Record for ArtifactReaction {
    const TABLE: Table = Table::ArtifactReactions;

    fn key(&self) -> String {
        self.0.id.to_string()
    }

    fn watermark(&self) -> Watermark {
        Watermark::Id(self.0.id)
    }

    fn parent_key(&self) -> Option<&str> {
        Some(&self.0.entity_id)
    }
}

impl ReactionRecord for ArtifactReaction {
    fn reaction(&self) -> &Reaction {
        &self.0
    }
}

/// Server-emitted record of a deleted row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub id: i64,
    pub table_name: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub results: Vec<T>,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub used: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSetting {
    pub max_batch_size: u32,
}

/// Authoritative description of one remote device, as polled.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub models: BTreeMap<String, Vec<String>>,
    pub hidden_models: Vec<String>,
    pub installed_nodes: Vec<String>,
    pub installed_pip: Vec<String>,
    pub model_settings: BTreeMap<String, ModelSetting>,
    pub queue_count: u32,
    pub last_update: Option<DateTime<Utc>>,
    pub gpus: Vec<GpuInfo>,
}

/// Partial device update. Every present field replaces the snapshot's field whole.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSnapshotPatch {
    pub device_id: Option<String>,
    pub models: Option<BTreeMap<String, Vec<String>>>,
    pub hidden_models: Option<Vec<String>>,
    pub installed_nodes: Option<Vec<String>>,
    pub installed_pip: Option<Vec<String>>,
    pub model_settings: Option<BTreeMap<String, ModelSetting>>,
    pub queue_count: Option<u32>,
    pub last_update: Option<DateTime<Utc>>,
    pub gpus: Option<Vec<GpuInfo>>,
}

impl DeviceSnapshot {
    pub fn apply(&mut self, patch: DeviceSnapshotPatch) {
        if let Some(device_id) = patch.device_id {
            self.device_id = device_id;
        }
        if let Some(models) = patch.models {
            self.models = models;
        }
        if let Some(hidden_models) = patch.hidden_models {
            self.hidden_models = hidden_models;
        }
        if let Some(installed_nodes) = patch.installed_nodes {
            self.installed_nodes = installed_nodes;
        }
        if let Some(installed_pip) = patch.installed_pip {
            self.installed_pip = installed_pip;
        }
        if let Some(model_settings) = patch.model_settings {
            self.model_settings = model_settings;
        }
        if let Some(queue_count) = patch.queue_count {
            self.queue_count = queue_count;
        }
        if let Some(last_update) = patch.last_update {
            self.last_update = Some(last_update);
        }
        if let Some(gpus) = patch.gpus {
            self.gpus = gpus;
        }
    }
}

impl From<DeviceSnapshot> for DeviceSnapshotPatch {
    fn from(value: DeviceSnapshot) -> Self {
        Self {
            device_id: Some(value.device_id),
            models: Some(value.models),
            hidden_models: Some(value.hidden_models),
            installed_nodes: Some(value.installed_nodes),
            installed_pip: Some(value.installed_pip),
            model_settings: Some(value.model_settings),
            queue_count: Some(value.queue_count),
            last_update: value.last_update,
            gpus: Some(value.gpus),
        }
    }
}

/// Poll response: the snapshot plus any status or error the device reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device: DeviceSnapshot,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<RemoteError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueEntryType {
    Node,
    Model,
    Package,
}

impl QueueEntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Model => "model",
            Self::Package => "package",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueDirection {
    Download,
    Uninstall,
}

impl QueueDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Uninstall => "uninstall",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub entry_type: QueueEntryType,
    pub key: String,
    pub status: QueueStatus,
    pub queued_at: DateTime<Utc>,
}

/// Identity of something the installer can track on a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackKey {
    Model { save_path: String, file_name: String },
    Node { url: String },
    Package { name: String },
}

impl TrackKey {
    pub fn model(save_path: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self::Model {
            save_path: save_path.into(),
            file_name: file_name.into(),
        }
    }

    pub fn node(url: impl Into<String>) -> Self {
        Self::Node { url: url.into() }
    }

    pub fn package(name: impl Into<String>) -> Self {
        Self::Package { name: name.into() }
    }

    /// Parses `"checkpoints/a.safetensors"` into save path and file name.
    pub fn model_path(path: &str) -> Self {
        match path.rsplit_once('/') {
            Some((save_path, file_name)) => Self::model(save_path, file_name),
            None => Self::model("", path),
        }
    }

    pub fn entry_type(&self) -> QueueEntryType {
        match self {
            Self::Model { .. } => QueueEntryType::Model,
            Self::Node { .. } => QueueEntryType::Node,
            Self::Package { .. } => QueueEntryType::Package,
        }
    }

    pub fn as_key(&self) -> String {
        match self {
            Self::Model { save_path, file_name } => model_key(save_path, file_name),
            Self::Node { url } => url.clone(),
            Self::Package { name } => name.clone(),
        }
    }
}

pub fn model_key(save_path: &str, file_name: &str) -> String {
    let save_path = save_path.trim_end_matches('/');
    if save_path.is_empty() {
        file_name.to_string()
    } else {
        format!("{}/{}", save_path, file_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTarget {
    pub url: String,
    pub save_path: String,
    pub file_name: String,
}

impl ModelTarget {
    pub fn track_key(&self) -> TrackKey {
        TrackKey::model(self.save_path.clone(), self.file_name.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallState {
    Installed,
    Installing,
    Uninstalling,
    Available,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// `None` requests the server's default page for entity tables.
    pub entity_page_size: Option<u32>,
    pub reaction_page_size: u32,
    pub deletion_page_size: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            entity_page_size: None,
            reaction_page_size: 500,
            deletion_page_size: 1000,
        }
    }
}

impl SyncSettings {
    pub fn page_size(&self, table: Table) -> Option<u32> {
        match table.watermark_kind() {
            WatermarkKind::Id => Some(self.reaction_page_size),
            WatermarkKind::ModifiedDate => self.entity_page_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallerSettings {
    pub poll_interval_ms: u64,
    pub close_debounce_ms: u64,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            close_debounce_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub sync: SyncSettings,
    pub installer: InstallerSettings,
}
