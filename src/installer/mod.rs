pub mod close;
pub mod monitor;
pub mod queue;
pub mod status;

use crate::api::{InstallRequest, RemoteApi};
use crate::db::Database;
use crate::errors::{AppError, AppResult, RemoteError, RemoteResult};
use crate::models::{
    model_key, DeviceSnapshot, DeviceSnapshotPatch, DeviceStatus, InstallState, InstallerSettings, ModelSetting,
    ModelTarget, QueueDirection, QueueEntry, QueueEntryType, TrackKey,
};
use crate::policy::{AccessPolicy, Action};
use crate::session::Identity;
use async_trait::async_trait;
use close::{CloseHandler, CloseHandlers};
use monitor::PollMonitor;
use queue::InstallQueue;
use status::{InstallerStatus, StatusChannel};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Interactive confirmation for destructive actions.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Answers every prompt the same way. Useful for headless callers and tests.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Confirm for AutoConfirm {
    async fn confirm(&self, _prompt: &str) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The remote accepted the request and the entry is queued locally.
    Queued(QueueEntry),
    /// The remote accepted a change that was applied to the snapshot directly.
    Applied,
    /// The user declined confirmation; nothing was sent.
    Declined,
    /// The remote refused; the error channel holds the same error.
    Failed(RemoteError),
}

#[derive(Debug, Default)]
struct TrackerState {
    snapshot: DeviceSnapshot,
    installed_models: HashSet<String>,
    queue: InstallQueue,
}

impl TrackerState {
    fn recompute_models(&mut self) {
        self.installed_models = self
            .snapshot
            .models
            .iter()
            .flat_map(|(category, files)| files.iter().map(move |file| model_key(category, file)))
            .collect();
    }

    fn is_installed(&self, key: &TrackKey) -> bool {
        match key {
            TrackKey::Model { .. } => self.installed_models.contains(&key.as_key()),
            TrackKey::Node { url } => self.snapshot.installed_nodes.iter().any(|node| node == url),
            TrackKey::Package { name } => self.snapshot.installed_pip.iter().any(|pip| pip == name),
        }
    }

    fn install_state(&self, key: &TrackKey) -> InstallState {
        if self.is_installed(key) {
            if self.queue.contains(QueueDirection::Uninstall, key) {
                InstallState::Uninstalling
            } else {
                InstallState::Installed
            }
        } else if self.queue.contains(QueueDirection::Download, key) {
            InstallState::Installing
        } else {
            InstallState::Available
        }
    }
}

/// Tracks install and uninstall jobs for one device.
///
/// State per key is derived from the device snapshot and the two optimistic
/// queues; nothing else is stored. Remote failures land on the status channel
/// and never mutate queues or the snapshot.
pub struct DeviceInstaller {
    device_id: String,
    api: Arc<dyn RemoteApi>,
    store: Option<Arc<Database>>,
    identity: Option<Identity>,
    policy: AccessPolicy,
    confirm: Arc<dyn Confirm>,
    poll_interval: Duration,
    state: Mutex<TrackerState>,
    status: StatusChannel,
    close_handlers: CloseHandlers,
    monitor: PollMonitor,
    this: Weak<DeviceInstaller>,
}

pub struct InstallerOptions {
    pub device_id: String,
    pub api: Arc<dyn RemoteApi>,
    /// Where the queue and last snapshot persist; `None` keeps them in memory.
    pub store: Option<Arc<Database>>,
    pub identity: Option<Identity>,
    pub confirm: Arc<dyn Confirm>,
    pub settings: InstallerSettings,
}

impl DeviceInstaller {
    /// Builds a tracker, restoring any persisted queue and snapshot for the device.
    pub fn new(options: InstallerOptions) -> AppResult<Arc<Self>> {
        let InstallerOptions {
            device_id,
            api,
            store,
            identity,
            confirm,
            settings,
        } = options;

        let mut state = TrackerState::default();
        if let Some(store) = &store {
            let record = store.load_installer_state(&device_id)?;
            state.queue = InstallQueue::from_parts(record.downloads, record.uninstalls);
            if let Some(snapshot) = record.snapshot {
                state.snapshot = snapshot;
            }
        }
        if state.snapshot.device_id.is_empty() {
            state.snapshot.device_id = device_id.clone();
        }
        state.recompute_models();

        Ok(Arc::new_cyclic(|this| Self {
            device_id,
            api,
            store,
            identity,
            policy: AccessPolicy::new(),
            confirm,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            state: Mutex::new(state),
            status: StatusChannel::default(),
            close_handlers: CloseHandlers::new(Duration::from_millis(settings.close_debounce_ms)),
            monitor: PollMonitor::default(),
            this: this.clone(),
        }))
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Applies `mutate` and persists the result while still holding the lock,
    /// so writes reach the store in mutation order.
    fn mutate<T>(&self, mutate: impl FnOnce(&mut TrackerState) -> T) -> T {
        let mut state = self.lock();
        let result = mutate(&mut state);
        self.persist(&state);
        result
    }

    fn persist(&self, state: &TrackerState) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(error) = store.save_installer_state(
            &self.device_id,
            Some(&state.snapshot),
            state.queue.downloads(),
            state.queue.uninstalls(),
        ) {
            tracing::warn!(device_id = %self.device_id, error = %error, "failed to persist installer state");
        }
    }

    fn fail(&self, action: &str, key: &str, error: RemoteError) -> ActionOutcome {
        tracing::warn!(device_id = %self.device_id, key = %key, error = %error, "{} failed", action);
        self.status.set_error(error.clone());
        ActionOutcome::Failed(error)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn downloads(&self) -> Vec<QueueEntry> {
        self.lock().queue.downloads().to_vec()
    }

    pub fn uninstalls(&self) -> Vec<QueueEntry> {
        self.lock().queue.uninstalls().to_vec()
    }

    pub fn install_state(&self, key: &TrackKey) -> InstallState {
        self.lock().install_state(key)
    }

    pub fn is_installed(&self, key: &TrackKey) -> bool {
        self.lock().is_installed(key)
    }

    pub fn is_installing(&self, key: &TrackKey) -> bool {
        self.install_state(key) == InstallState::Installing
    }

    pub fn is_uninstalling(&self, key: &TrackKey) -> bool {
        self.install_state(key) == InstallState::Uninstalling
    }

    pub fn is_model_installed(&self, path: &str) -> bool {
        self.is_installed(&TrackKey::model_path(path))
    }

    pub fn is_model_hidden(&self, path: &str) -> bool {
        self.lock().snapshot.hidden_models.iter().any(|hidden| hidden == path)
    }

    pub fn status(&self) -> InstallerStatus {
        self.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<InstallerStatus> {
        self.status.subscribe()
    }

    pub async fn install_model(&self, target: ModelTarget) -> AppResult<ActionOutcome> {
        self.install(InstallRequest::Model(target)).await
    }

    pub async fn install_node(&self, url: &str) -> AppResult<ActionOutcome> {
        self.install(InstallRequest::Node { url: url.to_string() }).await
    }

    pub async fn install_package(&self, name: &str) -> AppResult<ActionOutcome> {
        self.install(InstallRequest::Package { name: name.to_string() }).await
    }

    async fn install(&self, request: InstallRequest) -> AppResult<ActionOutcome> {
        self.policy.authorize(Action::ManageDevice, self.identity.as_ref())?;
        let key = request.track_key();

        if let Err(error) = self.api.install(&self.device_id, &request).await {
            return Ok(self.fail("install", &key.as_key(), error));
        }

        let entry = self.mutate(|state| state.queue.push(QueueDirection::Download, &key));
        self.status.clear_error();
        tracing::info!(
            device_id = %self.device_id,
            entry_type = entry.entry_type.as_str(),
            key = %entry.key,
            "install queued"
        );
        Ok(ActionOutcome::Queued(entry))
    }

    pub async fn uninstall_model(&self, save_path: &str, file_name: &str) -> AppResult<ActionOutcome> {
        self.uninstall(TrackKey::model(save_path, file_name)).await
    }

    pub async fn uninstall_node(&self, url: &str) -> AppResult<ActionOutcome> {
        self.uninstall(TrackKey::node(url)).await
    }

    pub async fn uninstall_package(&self, name: &str) -> AppResult<ActionOutcome> {
        self.uninstall(TrackKey::package(name)).await
    }

    async fn uninstall(&self, key: TrackKey) -> AppResult<ActionOutcome> {
        self.policy.authorize(Action::ManageDevice, self.identity.as_ref())?;

        let prompt = format!(
            "Uninstall {} '{}' from device {}?",
            key.entry_type().as_str(),
            key.as_key(),
            self.device_id
        );
        if !self.confirm.confirm(&prompt).await {
            tracing::debug!(device_id = %self.device_id, key = %key.as_key(), "uninstall declined");
            return Ok(ActionOutcome::Declined);
        }

        if let Err(error) = self.api.uninstall(&self.device_id, &key).await {
            return Ok(self.fail("uninstall", &key.as_key(), error));
        }

        let entry = self.mutate(|state| state.queue.push(QueueDirection::Uninstall, &key));
        self.status.clear_error();
        tracing::info!(
            device_id = %self.device_id,
            entry_type = entry.entry_type.as_str(),
            key = %entry.key,
            "uninstall queued"
        );
        Ok(ActionOutcome::Queued(entry))
    }

    /// Drops every queued download. Keys still missing from the snapshot fall
    /// back to `Available`.
    pub fn clear_downloads(&self) -> AppResult<usize> {
        self.policy.authorize(Action::ManageDevice, self.identity.as_ref())?;
        Ok(self.mutate(|state| state.queue.clear_downloads()))
    }

    /// Merges a partial snapshot and reconciles the uninstall queue against it.
    ///
    /// Every node url present in `installedNodes` clears its uninstall entry,
    /// and any uninstall entry whose key is no longer installed has reached
    /// its end state and is dropped. Download entries are never removed here.
    pub fn update_device(&self, patch: DeviceSnapshotPatch) {
        let confirmed = self.mutate(|state| {
            state.snapshot.apply(patch);
            state.recompute_models();

            let TrackerState {
                snapshot,
                installed_models,
                queue,
            } = state;
            let nodes = snapshot.installed_nodes.iter().collect::<HashSet<_>>();
            queue.retain_uninstalls(|entry| {
                if entry.entry_type == QueueEntryType::Node && nodes.contains(&entry.key) {
                    return false;
                }
                match entry.entry_type {
                    QueueEntryType::Model => installed_models.contains(&entry.key),
                    QueueEntryType::Node => nodes.contains(&entry.key),
                    QueueEntryType::Package => snapshot.installed_pip.iter().any(|pip| *pip == entry.key),
                }
            })
        });
        if confirmed > 0 {
            tracing::debug!(device_id = %self.device_id, confirmed, "uninstall entries reconciled");
        }
    }

    pub async fn set_model_hidden(&self, path: &str, hidden: bool) -> AppResult<ActionOutcome> {
        self.policy.authorize(Action::AdministerModels, self.identity.as_ref())?;
        if let Err(error) = self.api.set_model_hidden(&self.device_id, path, hidden).await {
            return Ok(self.fail("set model visibility", path, error));
        }
        self.mutate(|state| {
            let hidden_models = &mut state.snapshot.hidden_models;
            hidden_models.retain(|existing| existing != path);
            if hidden {
                hidden_models.push(path.to_string());
            }
        });
        self.status.clear_error();
        Ok(ActionOutcome::Applied)
    }

    pub async fn set_model_max_batch_size(&self, path: &str, max_batch_size: u32) -> AppResult<ActionOutcome> {
        self.policy.authorize(Action::AdministerModels, self.identity.as_ref())?;
        if max_batch_size == 0 {
            return Err(AppError::Policy("maxBatchSize must be at least 1".to_string()));
        }
        let setting = ModelSetting { max_batch_size };
        if let Err(error) = self.api.set_model_settings(&self.device_id, path, setting).await {
            return Ok(self.fail("set model batch size", path, error));
        }
        self.mutate(|state| {
            state.snapshot.model_settings.insert(path.to_string(), setting);
        });
        self.status.clear_error();
        Ok(ActionOutcome::Applied)
    }

    fn apply_poll(&self, result: RemoteResult<DeviceStatus>) -> bool {
        match result {
            Ok(DeviceStatus { device, status, error }) => {
                self.update_device(device.into());
                self.status.apply_report(status, error);
                true
            }
            Err(error) => {
                tracing::warn!(device_id = %self.device_id, error = %error, "device poll failed");
                self.status.set_error(error);
                false
            }
        }
    }

    /// One poll outside the monitor loop. Returns whether it succeeded.
    pub async fn poll_now(&self) -> bool {
        let result = self.api.device_status(&self.device_id).await;
        self.apply_poll(result)
    }

    /// Starts the background poll loop. A no-op while one is already running.
    pub fn start_monitor(&self) -> bool {
        let this = self.this.clone();
        let interval = self.poll_interval;
        let started = self.monitor.start(move |token| run_monitor(this, token, interval));
        if started {
            tracing::debug!(device_id = %self.device_id, interval_ms = interval.as_millis() as u64, "poll monitor started");
        }
        started
    }

    /// Asks the loop to stop; returns its handle for callers that want to wait.
    pub fn stop_monitor(&self) -> Option<JoinHandle<()>> {
        self.monitor.stop()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }

    pub fn register_close_handler(&self, key: impl Into<String>, handler: CloseHandler) {
        self.close_handlers.register(key, handler);
    }

    pub fn unregister_close_handler(&self, key: &str) -> bool {
        self.close_handlers.unregister(key)
    }

    pub fn handle_close(&self) -> usize {
        self.close_handlers.handle_close()
    }
}

/// The poll loop. Holds only a weak reference between iterations so a dropped
/// tracker ends the loop.
async fn run_monitor(installer: Weak<DeviceInstaller>, token: CancellationToken, interval: Duration) {
    loop {
        if token.is_cancelled() {
            break;
        }
        let Some(tracker) = installer.upgrade() else {
            break;
        };

        let started = Instant::now();
        let result = tracker.api.device_status(&tracker.device_id).await;
        if token.is_cancelled() {
            break;
        }
        tracker.apply_poll(result);
        drop(tracker);

        let wait = interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ActionOutcome, AutoConfirm, Confirm, DeviceInstaller, InstallerOptions};
    use crate::api::memory::{ApiOperation, InMemoryApi};
    use crate::db::Database;
    use crate::errors::{AppError, RemoteError};
    use crate::models::{
        DatabaseScope, DeviceSnapshot, DeviceSnapshotPatch, InstallState, InstallerSettings, ModelTarget, TrackKey,
    };
    use crate::session::{Identity, Role};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const DEVICE: &str = "dev-1";

    fn device() -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: DEVICE.to_string(),
            models: BTreeMap::from([("checkpoints".to_string(), vec!["a.safetensors".to_string()])]),
            installed_nodes: vec!["https://github.com/org/node-a".to_string()],
            installed_pip: vec!["numpy".to_string()],
            ..DeviceSnapshot::default()
        }
    }

    fn operator() -> Identity {
        Identity::new("op").with_role(Role::Operator)
    }

    fn tracker(api: Arc<InMemoryApi>, store: Option<Arc<Database>>, identity: Identity) -> Arc<DeviceInstaller> {
        tracker_with(api, store, identity, Arc::new(AutoConfirm(true)), InstallerSettings::default())
    }

    fn tracker_with(
        api: Arc<InMemoryApi>,
        store: Option<Arc<Database>>,
        identity: Identity,
        confirm: Arc<dyn Confirm>,
        settings: InstallerSettings,
    ) -> Arc<DeviceInstaller> {
        DeviceInstaller::new(InstallerOptions {
            device_id: DEVICE.to_string(),
            api,
            store,
            identity: Some(identity),
            confirm,
            settings,
        })
        .expect("installer")
    }

    fn seeded_api() -> Arc<InMemoryApi> {
        let api = Arc::new(InMemoryApi::new());
        api.set_device(device());
        api
    }

    fn model_b() -> ModelTarget {
        ModelTarget {
            url: "https://models.example/b.safetensors".to_string(),
            save_path: "checkpoints".to_string(),
            file_name: "b.safetensors".to_string(),
        }
    }

    #[tokio::test]
    async fn install_is_visible_immediately_and_reconciles_on_poll() {
        let api = seeded_api();
        let installer = tracker(api.clone(), None, operator());
        assert!(installer.poll_now().await);
        assert!(installer.is_model_installed("checkpoints/a.safetensors"));

        let b = TrackKey::model_path("checkpoints/b.safetensors");
        let outcome = installer.install_model(model_b()).await.expect("authorized");
        assert!(matches!(outcome, ActionOutcome::Queued(_)));
        assert!(installer.is_installing(&b));

        // Device has not caught up yet.
        installer.poll_now().await;
        assert!(installer.is_installing(&b));

        api.settle_device(DEVICE);
        installer.poll_now().await;
        assert!(!installer.is_installing(&b));
        assert!(installer.is_installed(&b));
        assert_eq!(installer.install_state(&b), InstallState::Installed);
        // Downloads are not removed by reconciliation.
        assert_eq!(installer.downloads().len(), 1);
    }

    #[tokio::test]
    async fn queues_stay_mutually_exclusive() {
        let api = seeded_api();
        let installer = tracker(api.clone(), None, operator());
        installer.poll_now().await;

        let numpy = TrackKey::package("numpy");
        installer.uninstall_package("numpy").await.expect("uninstall");
        assert!(installer.is_uninstalling(&numpy));

        installer.install_package("numpy").await.expect("install");
        assert!(!installer.is_uninstalling(&numpy));
        assert_eq!(installer.install_state(&numpy), InstallState::Installed);

        installer.uninstall_package("numpy").await.expect("uninstall again");
        assert!(!installer.is_installing(&numpy));
        assert!(installer.downloads().is_empty());
    }

    #[tokio::test]
    async fn remote_failure_sets_error_and_leaves_queues() {
        let api = seeded_api();
        let installer = tracker(api.clone(), None, operator());
        api.fail(ApiOperation::Install, RemoteError::new("DEVICE_BUSY", "device is busy"));

        let outcome = installer.install_node("https://github.com/org/node-b").await.expect("authorized");
        assert_eq!(
            outcome,
            ActionOutcome::Failed(RemoteError::new("DEVICE_BUSY", "device is busy"))
        );
        assert!(installer.downloads().is_empty());
        assert_eq!(
            installer.status().visible_error().map(|error| error.code.clone()),
            Some("DEVICE_BUSY".to_string())
        );

        api.recover(ApiOperation::Install);
        installer.install_node("https://github.com/org/node-b").await.expect("retry");
        assert!(installer.status().error.is_none());
        assert_eq!(installer.downloads().len(), 1);
    }

    #[tokio::test]
    async fn declined_uninstall_sends_nothing() {
        let api = seeded_api();
        let installer = tracker_with(
            api.clone(),
            None,
            operator(),
            Arc::new(AutoConfirm(false)),
            InstallerSettings::default(),
        );

        let outcome = installer.uninstall_package("numpy").await.expect("authorized");
        assert_eq!(outcome, ActionOutcome::Declined);
        assert_eq!(api.call_count(ApiOperation::Uninstall), 0);
        assert!(installer.uninstalls().is_empty());
    }

    #[tokio::test]
    async fn members_cannot_manage_devices() {
        let api = seeded_api();
        let installer = tracker(api.clone(), None, Identity::new("member"));
        let err = installer.install_package("torch").await.expect_err("forbidden");
        assert!(matches!(err, AppError::Forbidden(_)));
        assert_eq!(api.call_count(ApiOperation::Install), 0);

        let err = installer.set_model_hidden("checkpoints/a.safetensors", true).await.expect_err("forbidden");
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn uninstall_entries_clear_once_end_state_is_reached() {
        let api = seeded_api();
        let installer = tracker(api.clone(), None, operator());
        installer.poll_now().await;

        installer.uninstall_model("checkpoints", "a.safetensors").await.expect("uninstall");
        let a = TrackKey::model("checkpoints", "a.safetensors");
        installer.poll_now().await;
        assert!(installer.is_uninstalling(&a));

        api.settle_device(DEVICE);
        installer.poll_now().await;
        assert!(installer.uninstalls().is_empty());
        assert_eq!(installer.install_state(&a), InstallState::Available);
    }

    #[tokio::test]
    async fn node_urls_in_installed_nodes_clear_uninstall_entries() {
        let api = seeded_api();
        let installer = tracker(api.clone(), None, operator());
        installer.poll_now().await;
        installer.uninstall_node("https://github.com/org/node-a").await.expect("uninstall");
        assert_eq!(installer.uninstalls().len(), 1);

        installer.update_device(DeviceSnapshotPatch {
            installed_nodes: Some(vec!["https://github.com/org/node-a".to_string()]),
            ..DeviceSnapshotPatch::default()
        });
        assert!(installer.uninstalls().is_empty());
    }

    #[tokio::test]
    async fn poll_surfaces_embedded_status_and_error() {
        let api = seeded_api();
        api.set_device_report(
            DEVICE,
            Some("Downloading b.safetensors".to_string()),
            Some(RemoteError::new("SLOW_DISK", "Downloading b.safetensors")),
        );
        let installer = tracker(api.clone(), None, operator());
        installer.poll_now().await;

        let status = installer.status();
        assert_eq!(status.status.as_deref(), Some("Downloading b.safetensors"));
        assert!(status.error.is_some());
        assert!(status.visible_error().is_none());

        api.fail(ApiOperation::DeviceStatus, RemoteError::new("OFFLINE", "device offline"));
        assert!(!installer.poll_now().await);
        assert_eq!(installer.status().error.map(|error| error.code), Some("OFFLINE".to_string()));
        assert!(installer.is_model_installed("checkpoints/a.safetensors"));
    }

    #[tokio::test]
    async fn queue_and_snapshot_survive_a_new_tracker() {
        let api = seeded_api();
        let store = Arc::new(Database::in_memory(DatabaseScope::User).expect("db"));
        let first = tracker(api.clone(), Some(store.clone()), operator());
        first.poll_now().await;
        first.install_package("torch").await.expect("install");
        drop(first);

        let second = tracker(api.clone(), Some(store), operator());
        assert!(second.is_installing(&TrackKey::package("torch")));
        assert!(second.is_installed(&TrackKey::package("numpy")));
    }

    #[tokio::test]
    async fn admin_model_updates_apply_to_snapshot() {
        let api = seeded_api();
        let installer = tracker(api.clone(), None, Identity::new("root").with_role(Role::Admin));
        let path = "checkpoints/a.safetensors";

        assert_eq!(installer.set_model_hidden(path, true).await.expect("hide"), ActionOutcome::Applied);
        assert!(installer.is_model_hidden(path));
        assert_eq!(
            installer.set_model_max_batch_size(path, 4).await.expect("batch"),
            ActionOutcome::Applied
        );
        assert_eq!(installer.snapshot().model_settings[path].max_batch_size, 4);
        assert!(matches!(
            installer.set_model_max_batch_size(path, 0).await,
            Err(AppError::Policy(_))
        ));
    }

    #[tokio::test]
    async fn clear_downloads_resets_pending_installs() {
        let api = seeded_api();
        let installer = tracker(api.clone(), None, operator());
        installer.install_package("torch").await.expect("install");
        assert_eq!(installer.clear_downloads().expect("clear"), 1);
        assert_eq!(installer.install_state(&TrackKey::package("torch")), InstallState::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_polls_no_faster_than_the_interval() {
        let api = seeded_api();
        let settings = InstallerSettings {
            poll_interval_ms: 5_000,
            ..InstallerSettings::default()
        };
        let installer = tracker_with(api.clone(), None, operator(), Arc::new(AutoConfirm(true)), settings);

        assert!(installer.start_monitor());
        assert!(!installer.start_monitor());
        tokio::time::sleep(Duration::from_millis(12_500)).await;

        let times = api.call_times(ApiOperation::DeviceStatus);
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(5_000));
        }

        let handle = installer.stop_monitor().expect("running");
        handle.await.expect("loop ends");
        tokio::time::sleep(Duration::from_millis(20_000)).await;
        assert_eq!(api.call_count(ApiOperation::DeviceStatus), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_tracker_ends_the_loop() {
        let api = seeded_api();
        let installer = tracker(api.clone(), None, operator());
        installer.start_monitor();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(installer);

        tokio::time::sleep(Duration::from_millis(30_000)).await;
        assert_eq!(api.call_count(ApiOperation::DeviceStatus), 1);
    }

    #[tokio::test]
    async fn close_handlers_fire_once_per_window() {
        let api = seeded_api();
        let installer = tracker(api, None, operator());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        installer.register_close_handler(
            "install-dialog",
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(installer.handle_close(), 1);
        assert_eq!(installer.handle_close(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(installer.unregister_close_handler("install-dialog"));
    }
}
