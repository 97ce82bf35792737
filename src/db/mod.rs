use crate::errors::{AppError, AppResult};
use crate::models::{
    AppSettings, DatabaseScope, DeviceSnapshot, QueueDirection, QueueEntry, Record, Table, Watermark, WatermarkKind,
};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

mod stores;

pub use stores::Stores;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Ascending,
    Descending,
}

/// Range over a table's watermark index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRange {
    pub order: ScanOrder,
    /// Exclusive start: rows strictly after this value in scan order.
    pub start_after: Option<Watermark>,
    pub limit: Option<usize>,
}

impl ScanRange {
    pub fn ascending() -> Self {
        Self {
            order: ScanOrder::Ascending,
            start_after: None,
            limit: None,
        }
    }

    pub fn descending() -> Self {
        Self {
            order: ScanOrder::Descending,
            start_after: None,
            limit: None,
        }
    }

    pub fn after(mut self, value: Watermark) -> Self {
        self.start_after = Some(value);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub key: String,
    pub watermark: Option<Watermark>,
    pub parent_key: Option<String>,
    pub body_json: String,
}

impl StoredRow {
    pub fn decode<R: Record>(&self) -> AppResult<R> {
        serde_json::from_str(&self.body_json).map_err(AppError::from)
    }
}

#[derive(Debug, Default)]
pub struct InstallerRecord {
    pub snapshot: Option<DeviceSnapshot>,
    pub downloads: Vec<QueueEntry>,
    pub uninstalls: Vec<QueueEntry>,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    scope: DatabaseScope,
}

impl Database {
    pub fn new(path: &Path, scope: DatabaseScope) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::StoreUnavailable(format!("cannot create {}: {}", parent.display(), err))
            })?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        Self::from_connection(conn, path.to_path_buf(), scope)
    }

    pub fn in_memory(scope: DatabaseScope) -> AppResult<Self> {
        let conn = Connection::open_in_memory().map_err(AppError::from)?;
        Self::from_connection(conn, PathBuf::from(":memory:"), scope)
    }

    fn from_connection(conn: Connection, db_path: PathBuf, scope: DatabaseScope) -> AppResult<Self> {
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path,
            scope,
        };

        db.upgrade()?;
        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn scope(&self) -> DatabaseScope {
        self.scope
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    fn ensure_table(&self, table: Table) -> AppResult<()> {
        if table.scope() != self.scope {
            return Err(AppError::Internal(format!(
                "table {} is not stored in the {} database",
                table,
                self.scope.as_str()
            )));
        }
        Ok(())
    }

    pub fn get<R: Record>(&self, key: &str) -> AppResult<Option<R>> {
        self.ensure_table(R::TABLE)?;
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT body_json FROM {} WHERE key = ?1", R::TABLE.as_str()),
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        raw.map(|body| serde_json::from_str(&body).map_err(AppError::from))
            .transpose()
    }

    /// All rows in first-insert order.
    pub fn get_all<R: Record>(&self) -> AppResult<Vec<R>> {
        self.ensure_table(R::TABLE)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT body_json FROM {} ORDER BY rowid ASC",
            R::TABLE.as_str()
        ))?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(AppError::from))
            .collect()
    }

    /// Rows whose parent key matches, in first-insert order.
    pub fn get_children<R: Record>(&self, parent_key: &str) -> AppResult<Vec<R>> {
        self.ensure_table(R::TABLE)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT body_json FROM {} WHERE parent_key = ?1 ORDER BY rowid ASC",
            R::TABLE.as_str()
        ))?;
        let bodies = stmt
            .query_map([parent_key], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(AppError::from))
            .collect()
    }

    pub fn put<R: Record>(&self, record: &R) -> AppResult<()> {
        self.put_all(std::slice::from_ref(record)).map(|_| ())
    }

    /// Upserts by primary key inside one transaction. Returns the number of rows written.
    pub fn put_all<R: Record>(&self, records: &[R]) -> AppResult<usize> {
        self.ensure_table(R::TABLE)?;
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (key, modified_date, seq_id, parent_key, body_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                   modified_date = excluded.modified_date,
                   seq_id = excluded.seq_id,
                   parent_key = excluded.parent_key,
                   body_json = excluded.body_json",
                R::TABLE.as_str()
            ))?;
            for record in records {
                let (modified_date, seq_id) = match record.watermark() {
                    Watermark::ModifiedDate(date) => (Some(date), None),
                    Watermark::Id(id) => (None, Some(id)),
                };
                stmt.execute(params![
                    record.key(),
                    modified_date,
                    seq_id,
                    record.parent_key(),
                    serde_json::to_string(record)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn delete(&self, table: Table, key: &str) -> AppResult<bool> {
        self.ensure_table(table)?;
        let conn = self.lock()?;
        let changed = conn.execute(&format!("DELETE FROM {} WHERE key = ?1", table.as_str()), [key])?;
        Ok(changed > 0)
    }

    pub fn count(&self, table: Table) -> AppResult<u64> {
        self.ensure_table(table)?;
        let conn = self.lock()?;
        let count: i64 = conn.query_row(&format!("SELECT COUNT(1) FROM {}", table.as_str()), [], |row| {
            row.get(0)
        })?;
        Ok(count.max(0) as u64)
    }

    /// Ordered scan over the watermark index (`modified_date` or `seq_id`).
    pub fn scan(&self, table: Table, range: &ScanRange) -> AppResult<Vec<StoredRow>> {
        self.ensure_table(table)?;
        let kind = table.watermark_kind();
        let column = watermark_column(kind);
        let (comparison, direction) = match range.order {
            ScanOrder::Ascending => (">", "ASC"),
            ScanOrder::Descending => ("<", "DESC"),
        };

        let mut query = format!(
            "SELECT key, modified_date, seq_id, parent_key, body_json FROM {} WHERE {} IS NOT NULL",
            table.as_str(),
            column
        );
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(start_after) = &range.start_after {
            query.push_str(&format!(" AND {} {} ?", column, comparison));
            values.push(match start_after {
                Watermark::ModifiedDate(date) => rusqlite::types::Value::Text(date.clone()),
                Watermark::Id(id) => rusqlite::types::Value::Integer(*id),
            });
        }
        query.push_str(&format!(" ORDER BY {} {}, key {}", column, direction, direction));
        if let Some(limit) = range.limit {
            query.push_str(" LIMIT ?");
            values.push(rusqlite::types::Value::Integer(limit as i64));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), |row| {
                let modified_date: Option<String> = row.get(1)?;
                let seq_id: Option<i64> = row.get(2)?;
                let watermark = match kind {
                    WatermarkKind::ModifiedDate => modified_date.map(Watermark::ModifiedDate),
                    WatermarkKind::Id => seq_id.map(Watermark::Id),
                };
                Ok(StoredRow {
                    key: row.get(0)?,
                    watermark,
                    parent_key: row.get(3)?,
                    body_json: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Highest watermark present in the table: first entry of a descending index scan.
    pub fn watermark(&self, table: Table) -> AppResult<Option<Watermark>> {
        let rows = self.scan(table, &ScanRange::descending().limit(1))?;
        Ok(rows.into_iter().next().and_then(|row| row.watermark))
    }

    pub fn kv_get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .map_err(AppError::from)
    }

    pub fn kv_set(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn kv_get_i64(&self, key: &str) -> AppResult<Option<i64>> {
        match self.kv_get(key)? {
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|err| AppError::Internal(format!("kv '{}' is not an integer: {}", key, err))),
            None => Ok(None),
        }
    }

    pub fn kv_set_i64(&self, key: &str, value: i64) -> AppResult<()> {
        self.kv_set(key, &value.to_string())
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'app'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<AppSettings>(&raw).unwrap_or_default()),
            None => Ok(AppSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let settings = merge_settings(&self.get_settings()?, update)?;
        self.save_settings(&settings)?;
        Ok(settings)
    }

    pub fn save_settings(&self, settings: &AppSettings) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('app', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(settings)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_installer_state(&self, device_id: &str) -> AppResult<InstallerRecord> {
        let conn = self.lock()?;
        let snapshot = conn
            .query_row(
                "SELECT snapshot_json FROM device_snapshots WHERE device_id = ?1",
                [device_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|raw| serde_json::from_str::<DeviceSnapshot>(&raw))
            .transpose()?;

        let mut stmt = conn.prepare(
            "SELECT direction, entry_json FROM installer_queue
             WHERE device_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map([device_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut record = InstallerRecord {
            snapshot,
            ..InstallerRecord::default()
        };
        for (direction, raw) in rows {
            let entry: QueueEntry = serde_json::from_str(&raw)?;
            match parse_direction(&direction) {
                Some(QueueDirection::Download) => record.downloads.push(entry),
                Some(QueueDirection::Uninstall) => record.uninstalls.push(entry),
                None => {
                    tracing::warn!(device_id = %device_id, direction = %direction, "skipping queue entry with unknown direction");
                }
            }
        }
        Ok(record)
    }

    /// Replaces the device's queue, and its snapshot when given, in one transaction.
    pub fn save_installer_state(
        &self,
        device_id: &str,
        snapshot: Option<&DeviceSnapshot>,
        downloads: &[QueueEntry],
        uninstalls: &[QueueEntry],
    ) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM installer_queue WHERE device_id = ?1", [device_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO installer_queue (device_id, direction, key, seq, entry_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let entries = downloads
                .iter()
                .map(|entry| (QueueDirection::Download, entry))
                .chain(uninstalls.iter().map(|entry| (QueueDirection::Uninstall, entry)));
            for (seq, (direction, entry)) in entries.enumerate() {
                stmt.execute(params![
                    device_id,
                    direction.as_str(),
                    entry.key,
                    seq as i64,
                    serde_json::to_string(entry)?,
                ])?;
            }
        }
        if let Some(snapshot) = snapshot {
            tx.execute(
                "INSERT INTO device_snapshots (device_id, snapshot_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(device_id) DO UPDATE SET snapshot_json = excluded.snapshot_json, updated_at = excluded.updated_at",
                params![device_id, serde_json::to_string(snapshot)?, Utc::now().to_rfc3339()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn upgrade(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(AppError::StoreUnavailable(format!(
                "{} database at {} has schema version {}, newer than supported {}",
                self.scope.as_str(),
                self.db_path.to_string_lossy(),
                version,
                SCHEMA_VERSION
            )));
        }

        for table in Table::tables_in(self.scope) {
            let name = table.as_str();
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                   key TEXT PRIMARY KEY,
                   modified_date TEXT,
                   seq_id INTEGER,
                   parent_key TEXT,
                   body_json TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_{name}_modified_date ON {name}(modified_date);
                 CREATE INDEX IF NOT EXISTS idx_{name}_seq_id ON {name}(seq_id);
                 CREATE INDEX IF NOT EXISTS idx_{name}_parent_key ON {name}(parent_key);"
            ))?;
        }

        if version < SCHEMA_VERSION {
            conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
            tracing::info!(
                scope = self.scope.as_str(),
                from = version,
                to = SCHEMA_VERSION,
                "upgraded local database schema"
            );
        }
        Ok(())
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM settings WHERE key = 'app'", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('app', ?1, ?2)",
                params![
                    serde_json::to_string(&AppSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }
}

fn watermark_column(kind: WatermarkKind) -> &'static str {
    match kind {
        WatermarkKind::ModifiedDate => "modified_date",
        WatermarkKind::Id => "seq_id",
    }
}

fn parse_direction(raw: &str) -> Option<QueueDirection> {
    match raw {
        "download" => Some(QueueDirection::Download),
        "uninstall" => Some(QueueDirection::Uninstall),
        _ => None,
    }
}

/// Deep-merges a partial JSON update into `current`.
pub fn merge_settings(current: &AppSettings, update: serde_json::Value) -> AppResult<AppSettings> {
    let mut merged = serde_json::to_value(current)?;
    merge_json(&mut merged, update);
    Ok(serde_json::from_value(merged)?)
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
