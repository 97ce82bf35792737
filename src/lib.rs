pub mod api;
pub mod client;
pub mod db;
pub mod errors;
pub mod installer;
pub mod models;
pub mod policy;
pub mod projection;
pub mod session;
pub mod sync;

pub use crate::api::memory::InMemoryApi;
pub use crate::api::{InstallRequest, RemoteApi};
pub use crate::client::{ClientCore, ClientOptions, ReloadReport, TableOutcome};
pub use crate::errors::{AppError, AppResult, RemoteError};
pub use crate::installer::{ActionOutcome, AutoConfirm, Confirm, DeviceInstaller};
pub use crate::models::{AppSettings, Table};
pub use crate::policy::{AccessPolicy, Action};
pub use crate::projection::{Projections, WorkflowView};
pub use crate::session::{Identity, Role};
pub use crate::sync::tombstones::DeletionReport;
pub use crate::sync::SyncReport;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs a JSON subscriber writing daily-rolled files under `data_dir/logs`.
/// `RUST_LOG` overrides the default `info` filter. Only the first call wins.
pub fn init_tracing(data_dir: &Path) -> AppResult<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "fleet-client.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(format!("tracing already initialised: {}", error)))
}
