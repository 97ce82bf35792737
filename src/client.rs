use crate::api::RemoteApi;
use crate::db::{merge_settings, Database, Stores};
use crate::errors::{AppError, AppResult};
use crate::installer::{Confirm, DeviceInstaller, InstallerOptions};
use crate::models::{
    AppSettings, ArtifactReaction, DatabaseScope, Generation, Record, Table, Workflow, WorkflowReaction,
    WorkflowVersion,
};
use crate::policy::{AccessPolicy, Action};
use crate::projection::Projections;
use crate::session::Identity;
use crate::sync::paging::{load_remote, Collected};
use crate::sync::tombstones::{DeletionReport, TombstoneProcessor};
use crate::sync::{SyncEngine, SyncReport};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Page size for `skip`/`take` listing when no entity page size is configured.
const DEFAULT_LIST_PAGE_SIZE: u32 = 100;

pub struct ClientOptions {
    pub data_dir: PathBuf,
    pub identity: Option<Identity>,
    pub api: Arc<dyn RemoteApi>,
    pub confirm: Arc<dyn Confirm>,
}

#[derive(Debug)]
pub struct TableOutcome {
    pub table: Table,
    pub result: AppResult<SyncReport>,
}

/// Result of one full reload. Each table and the deletion pass succeed or
/// fail on their own.
#[derive(Debug)]
pub struct ReloadReport {
    pub network_only: bool,
    pub tables: Vec<TableOutcome>,
    pub deletions: Option<AppResult<DeletionReport>>,
}

impl ReloadReport {
    pub fn outcome(&self, table: Table) -> Option<&AppResult<SyncReport>> {
        self.tables
            .iter()
            .find(|outcome| outcome.table == table)
            .map(|outcome| &outcome.result)
    }

    pub fn failed_tables(&self) -> Vec<Table> {
        self.tables
            .iter()
            .filter(|outcome| outcome.result.is_err())
            .map(|outcome| outcome.table)
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_tables().is_empty() && !matches!(self.deletions, Some(Err(_)))
    }
}

/// Entry point: owns the local stores, the sync passes, derived views and
/// per-device installers for one signed-in identity (or none).
pub struct ClientCore {
    api: Arc<dyn RemoteApi>,
    identity: Option<Identity>,
    policy: AccessPolicy,
    confirm: Arc<dyn Confirm>,
    stores: Option<Stores>,
    settings: RwLock<AppSettings>,
    projections: Arc<Projections>,
    installers: Mutex<HashMap<String, Arc<DeviceInstaller>>>,
    data_dir: PathBuf,
}

impl ClientCore {
    /// Opens the app database and, when signed in, the user's database.
    ///
    /// A store that cannot be opened degrades the session to network-only
    /// instead of failing.
    pub fn open(options: ClientOptions) -> AppResult<Self> {
        let ClientOptions {
            data_dir,
            identity,
            api,
            confirm,
        } = options;

        let stores = match open_stores(&data_dir, identity.as_ref()) {
            Ok(stores) => Some(stores),
            Err(AppError::StoreUnavailable(reason)) => {
                tracing::warn!(
                    data_dir = %data_dir.to_string_lossy(),
                    reason = %reason,
                    "local store unavailable; running network-only"
                );
                None
            }
            Err(error) => return Err(error),
        };

        let settings = match &stores {
            Some(stores) => stores.app().get_settings()?,
            None => AppSettings::default(),
        };

        tracing::info!(
            signed_in = identity.is_some(),
            network_only = stores.is_none(),
            "client core opened"
        );

        Ok(Self {
            api,
            identity,
            policy: AccessPolicy::new(),
            confirm,
            projections: Arc::new(Projections::new(stores.clone())),
            stores,
            settings: RwLock::new(settings),
            installers: Mutex::new(HashMap::new()),
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_network_only(&self) -> bool {
        self.stores.is_none()
    }

    pub fn stores(&self) -> Option<&Stores> {
        self.stores.as_ref()
    }

    pub fn projections(&self) -> Arc<Projections> {
        self.projections.clone()
    }

    pub fn settings(&self) -> AppSettings {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Deep-merges `update` into the current settings, validates, then persists.
    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let next = merge_settings(&self.settings(), update)?;
        self.policy.validate_settings(&next)?;
        if let Some(stores) = &self.stores {
            stores.app().save_settings(&next)?;
        }
        match self.settings.write() {
            Ok(mut guard) => *guard = next.clone(),
            Err(poisoned) => *poisoned.into_inner() = next.clone(),
        }
        Ok(next)
    }

    fn require_stores(&self) -> AppResult<&Stores> {
        self.stores
            .as_ref()
            .ok_or_else(|| AppError::StoreUnavailable("running network-only".to_string()))
    }

    fn authorize_table(&self, table: Table) -> AppResult<()> {
        if table.scope() == DatabaseScope::User {
            self.policy.authorize(Action::ReadUserData, self.identity.as_ref())?;
        }
        Ok(())
    }

    fn sync_engine(&self, stores: &Stores) -> SyncEngine {
        SyncEngine::new(self.api.clone(), stores.clone(), self.settings().sync)
    }

    fn tombstone_processor(&self, stores: &Stores) -> TombstoneProcessor {
        TombstoneProcessor::new(self.api.clone(), stores.clone(), self.settings().sync.deletion_page_size)
    }

    fn list_page_size(&self) -> u32 {
        self.settings().sync.entity_page_size.unwrap_or(DEFAULT_LIST_PAGE_SIZE)
    }

    /// Tables this session may read: app tables always, user tables when signed in.
    pub fn tables(&self) -> Vec<Table> {
        Table::ALL
            .into_iter()
            .filter(|table| table.scope() == DatabaseScope::App || self.identity.is_some())
            .collect()
    }

    /// Syncs one table and refreshes the views that depend on it.
    pub async fn sync_table(&self, table: Table) -> AppResult<SyncReport> {
        self.authorize_table(table)?;
        let stores = self.require_stores()?;
        let report = self.sync_engine(stores).sync(table).await?;
        self.projections.refresh(table)?;
        Ok(report)
    }

    pub async fn process_deletions(&self) -> AppResult<DeletionReport> {
        let stores = self.require_stores()?;
        let report = self.tombstone_processor(stores).process_deletions().await?;
        if report.deleted > 0 {
            self.refresh_all_projections();
        }
        Ok(report)
    }

    /// Full reload: every readable table syncs concurrently next to the
    /// deletion pass. One table failing never stops the others.
    pub async fn reload(&self) -> ReloadReport {
        let Some(stores) = &self.stores else {
            return self.reload_network_only().await;
        };

        let engine = self.sync_engine(stores);
        let tombstones = self.tombstone_processor(stores);
        let syncs = self.tables().into_iter().map(|table| {
            let engine = engine.clone();
            async move {
                let result = engine.sync(table).await;
                match &result {
                    Ok(_) => {
                        if let Err(error) = self.projections.refresh(table) {
                            tracing::warn!(table = %table, error = %error, "projection refresh failed");
                        }
                    }
                    Err(error) => {
                        tracing::warn!(table = %table, error = %error, "table sync failed");
                    }
                }
                TableOutcome { table, result }
            }
        });

        let (tables, deletions) = tokio::join!(join_all(syncs), tombstones.process_deletions());
        match &deletions {
            Ok(report) if report.deleted > 0 => self.refresh_all_projections(),
            Ok(_) => {}
            Err(error) => tracing::warn!(error = %error, "deletion pass failed"),
        }

        ReloadReport {
            network_only: false,
            tables,
            deletions: Some(deletions),
        }
    }

    async fn reload_network_only(&self) -> ReloadReport {
        let page_size = self.list_page_size();
        let api = self.api.as_ref();
        let mut tables = Vec::new();

        let workflows = load_remote::<Workflow>(api, page_size).await;
        let versions = load_remote::<WorkflowVersion>(api, page_size).await;
        if let (Ok(workflows), Ok(versions)) = (&workflows, &versions) {
            if let Err(error) = self
                .projections
                .replace_workflows(workflows.results.clone(), versions.results.clone())
            {
                tracing::warn!(error = %error, "projection refresh failed");
            }
        }
        tables.push(network_outcome(Table::Workflows, workflows));
        tables.push(network_outcome(Table::WorkflowVersions, versions));

        if self.identity.is_some() {
            let generations = load_remote::<Generation>(api, page_size).await;
            if let Ok(generations) = &generations {
                if let Err(error) = self.projections.replace_generations(generations.results.clone()) {
                    tracing::warn!(error = %error, "projection refresh failed");
                }
            }
            tables.push(network_outcome(Table::Generations, generations));

            let reaction_page = self.settings().sync.reaction_page_size;
            let workflow_reactions = load_remote::<WorkflowReaction>(api, reaction_page).await;
            if let Ok(reactions) = &workflow_reactions {
                if let Err(error) = self.projections.replace_reactions(&reactions.results) {
                    tracing::warn!(error = %error, "projection refresh failed");
                }
            }
            tables.push(network_outcome(Table::WorkflowReactions, workflow_reactions));

            let artifact_reactions = load_remote::<ArtifactReaction>(api, reaction_page).await;
            if let Ok(reactions) = &artifact_reactions {
                if let Err(error) = self.projections.replace_reactions(&reactions.results) {
                    tracing::warn!(error = %error, "projection refresh failed");
                }
            }
            tables.push(network_outcome(Table::ArtifactReactions, artifact_reactions));
        }

        for outcome in &tables {
            if let Err(error) = &outcome.result {
                tracing::warn!(table = %outcome.table, error = %error, "network-only load failed");
            }
        }

        ReloadReport {
            network_only: true,
            tables,
            deletions: None,
        }
    }

    fn refresh_all_projections(&self) {
        for table in [
            Table::Workflows,
            Table::Generations,
            Table::WorkflowReactions,
            Table::ArtifactReactions,
        ] {
            if let Err(error) = self.projections.refresh(table) {
                tracing::warn!(table = %table, error = %error, "projection refresh failed");
            }
        }
    }

    /// Rows of one table: from the local store, or straight from the network
    /// when running network-only.
    pub async fn load<R: Record>(&self) -> AppResult<Vec<R>> {
        self.authorize_table(R::TABLE)?;
        match &self.stores {
            Some(stores) => stores.for_table(R::TABLE)?.get_all::<R>(),
            None => Ok(load_remote::<R>(self.api.as_ref(), self.list_page_size()).await?.results),
        }
    }

    /// Saves remotely, then writes the server's copy locally.
    pub async fn save_entity<R: Record>(&self, record: &R) -> AppResult<R> {
        self.policy.authorize(Action::EditEntity, self.identity.as_ref())?;
        let body = serde_json::to_value(record)?;
        let saved = self.api.save_entity(R::TABLE, body).await?;
        let saved: R = serde_json::from_value(saved)
            .map_err(|err| AppError::Internal(format!("server returned malformed {}: {}", R::TABLE, err)))?;

        if let Some(stores) = &self.stores {
            stores.for_table(R::TABLE)?.put(&saved)?;
            self.projections.refresh(R::TABLE)?;
        }
        Ok(saved)
    }

    /// Deletes remotely; the local row goes only after the server confirms.
    /// Returns whether a local row was removed.
    pub async fn delete_entity<R: Record>(&self, key: &str) -> AppResult<bool> {
        self.policy.authorize(Action::EditEntity, self.identity.as_ref())?;
        self.api.delete_entity(R::TABLE, key).await?;

        let Some(stores) = &self.stores else {
            return Ok(false);
        };
        let removed = stores.for_table(R::TABLE)?.delete(R::TABLE, key)?;
        if removed {
            self.projections.refresh(R::TABLE)?;
        }
        Ok(removed)
    }

    /// The tracker for one device, created on first use and shared afterwards.
    pub fn installer(&self, device_id: &str) -> AppResult<Arc<DeviceInstaller>> {
        self.policy.authorize(Action::ReadUserData, self.identity.as_ref())?;
        let mut installers = self
            .installers
            .lock()
            .map_err(|_| AppError::Internal("installer registry poisoned".to_string()))?;
        if let Some(existing) = installers.get(device_id) {
            return Ok(existing.clone());
        }

        let store = match &self.stores {
            Some(stores) => Some(stores.user()?.clone()),
            None => None,
        };
        let installer = DeviceInstaller::new(InstallerOptions {
            device_id: device_id.to_string(),
            api: self.api.clone(),
            store,
            identity: self.identity.clone(),
            confirm: self.confirm.clone(),
            settings: self.settings().installer,
        })?;
        installers.insert(device_id.to_string(), installer.clone());
        Ok(installer)
    }

    /// Stops every poll monitor and waits for in-flight polls to finish.
    pub async fn shutdown(&self) {
        let installers = match self.installers.lock() {
            Ok(mut guard) => guard.drain().map(|(_, installer)| installer).collect::<Vec<_>>(),
            Err(poisoned) => poisoned
                .into_inner()
                .drain()
                .map(|(_, installer)| installer)
                .collect::<Vec<_>>(),
        };
        for installer in installers {
            if let Some(handle) = installer.stop_monitor() {
                if let Err(error) = handle.await {
                    tracing::warn!(device_id = %installer.device_id(), error = %error, "poll monitor ended abnormally");
                }
            }
        }
        tracing::info!("client core shut down");
    }
}

fn open_stores(data_dir: &Path, identity: Option<&Identity>) -> AppResult<Stores> {
    let app = Arc::new(Database::new(&data_dir.join("app.sqlite"), DatabaseScope::App)?);
    let user = match identity {
        Some(identity) => {
            let path = data_dir.join("users").join(identity.namespace()).join("cache.sqlite");
            Some(Arc::new(Database::new(&path, DatabaseScope::User)?))
        }
        None => None,
    };
    Ok(Stores::new(app, user))
}

fn network_outcome<R>(table: Table, loaded: AppResult<Collected<R>>) -> TableOutcome {
    TableOutcome {
        table,
        result: loaded.map(|collected| SyncReport {
            table,
            requests: collected.requests,
            rows: collected.results.len() as u64,
            watermark: None,
        }),
    }
}
