use crate::api::RemoteApi;
use crate::db::Stores;
use crate::errors::{AppError, AppResult};
use crate::models::Table;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

pub const DELETION_CURSOR_KEY: &str = "sync.deletions.after_id";

/// Server table names as they appear in deletion descriptors.
static TOMBSTONE_TABLES: Lazy<HashMap<&'static str, Table>> = Lazy::new(|| {
    HashMap::from([
        ("Workflow", Table::Workflows),
        ("WorkflowVersion", Table::WorkflowVersions),
        ("Artifact", Table::Artifacts),
        ("Asset", Table::Assets),
        ("Generation", Table::Generations),
        ("Thread", Table::Threads),
        ("WorkflowReaction", Table::WorkflowReactions),
        ("ArtifactReaction", Table::ArtifactReactions),
    ])
});

pub fn resolve_table(table_name: &str) -> Option<Table> {
    TOMBSTONE_TABLES.get(table_name).copied()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionReport {
    pub requests: u32,
    pub processed: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub cursor: i64,
}

#[derive(Clone)]
pub struct TombstoneProcessor {
    api: Arc<dyn RemoteApi>,
    stores: Stores,
    page_size: u32,
}

impl TombstoneProcessor {
    pub fn new(api: Arc<dyn RemoteApi>, stores: Stores, page_size: u32) -> Self {
        Self {
            api,
            stores,
            page_size: page_size.max(1),
        }
    }

    pub fn cursor(&self) -> AppResult<i64> {
        Ok(self.stores.settings().kv_get_i64(DELETION_CURSOR_KEY)?.unwrap_or(0))
    }

    /// Applies every deletion the server has recorded since the persisted cursor.
    ///
    /// The cursor only moves forward and is written once, after the fetch loop.
    /// A remote failure mid-loop keeps the rows already deleted but leaves the
    /// persisted cursor where it was, so the next pass replays those descriptors.
    pub async fn process_deletions(&self) -> AppResult<DeletionReport> {
        let start = self.cursor()?;
        let mut report = DeletionReport {
            cursor: start,
            ..DeletionReport::default()
        };

        loop {
            let page = self.api.fetch_deletions(report.cursor, self.page_size).await?;
            report.requests += 1;
            let before = report.cursor;

            for tombstone in &page {
                report.processed += 1;
                report.cursor = report.cursor.max(tombstone.id);

                let Some(table) = resolve_table(&tombstone.table_name) else {
                    tracing::warn!(
                        table_name = %tombstone.table_name,
                        tombstone_id = tombstone.id,
                        "skipping deletion for unknown table"
                    );
                    report.skipped += 1;
                    continue;
                };
                let db = match self.stores.for_table(table) {
                    Ok(db) => db,
                    Err(AppError::NotAuthenticated(_)) => {
                        tracing::debug!(table = %table, key = %tombstone.key, "no local store for deletion; skipping");
                        report.skipped += 1;
                        continue;
                    }
                    Err(error) => return Err(error),
                };
                if db.delete(table, &tombstone.key)? {
                    report.deleted += 1;
                }
            }

            if page.len() < self.page_size as usize {
                break;
            }
            if report.cursor == before {
                tracing::warn!(cursor = report.cursor, "deletion cursor did not advance after a full page; stopping");
                break;
            }
        }

        if report.cursor > start {
            self.stores.settings().kv_set_i64(DELETION_CURSOR_KEY, report.cursor)?;
        }
        tracing::debug!(
            requests = report.requests,
            deleted = report.deleted,
            skipped = report.skipped,
            cursor = report.cursor,
            "deletions processed"
        );
        Ok(report)
    }
}
