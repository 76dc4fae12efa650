/// Data migration between storage representations
///
/// Two pipelines live here:
/// 1. [`DocumentToSqliteMigration`] copies the document store collections into
///    the SQLite tables, turning embedded timestamps and interruptions into
///    child rows.
/// 2. [`JsonToPostgresMigration`] imports the legacy JSON files into the
///    remote PostgreSQL database.
///
/// Both run the same stages in the same order and report per-entity
/// [`MigrationStats`]. A record that cannot be migrated is logged and counted
/// as failed; it never aborts the batch.
pub mod document_to_sqlite;
pub mod json_to_postgres;

pub use document_to_sqlite::DocumentToSqliteMigration;
pub use json_to_postgres::JsonToPostgresMigration;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{normalize_day, normalize_instant, DomainError, SessionType};
use crate::storage::{Document, StorageError};

/// Directory, under the source data directory, that receives backups
pub const BACKUP_DIR: &str = "migration-backup";

/// Errors that stop a migration run
///
/// Failures of single records are [`RecordError`]s instead and only show up
/// in the report.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Failed to initialize connections: {0}")]
    Connection(#[source] StorageError),

    #[error("{stage} migration failed: {source}")]
    Stage {
        stage: EntityKind,
        #[source]
        source: StorageError,
    },

    #[error("Migration verification failed: {0}")]
    Verification(#[source] StorageError),

    #[error("Could not read {}: {source}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// The kinds of records a migration moves, in migration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Categories,
    CustomCategoryMappings,
    AppUsage,
    Timestamps,
    FocusSessions,
    Interruptions,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Categories,
        EntityKind::CustomCategoryMappings,
        EntityKind::AppUsage,
        EntityKind::Timestamps,
        EntityKind::FocusSessions,
        EntityKind::Interruptions,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Categories => "categories",
            EntityKind::CustomCategoryMappings => "customCategoryMappings",
            EntityKind::AppUsage => "appUsage",
            EntityKind::Timestamps => "timestamps",
            EntityKind::FocusSessions => "focusSessions",
            EntityKind::Interruptions => "interruptions",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Counters for one entity kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    pub total: u64,
    pub migrated: u64,
    pub failed: u64,
}

impl MigrationStats {
    /// Share of records migrated, in percent; 100 when there was nothing to do
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.migrated as f64 / self.total as f64 * 100.0
        }
    }
}

/// A record that could not be migrated
#[derive(Debug, Clone, PartialEq)]
pub struct RecordError {
    pub entity: EntityKind,
    /// Short description of the record, e.g. its id or natural key
    pub record: String,
    pub message: String,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.entity, self.record, self.message)
    }
}

/// Outcome of a migration run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    pub stats: BTreeMap<EntityKind, MigrationStats>,
    /// Set when the run decided there was nothing to do
    pub skipped: Option<String>,
    pub backup: Option<PathBuf>,
    /// Destination row counts after the run, by table
    pub verification: BTreeMap<String, u64>,
    pub errors: Vec<RecordError>,
}

impl MigrationReport {
    pub(crate) fn skipped(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        info!("Migration skipped: {}", reason);
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn stats_for(&self, entity: EntityKind) -> MigrationStats {
        self.stats.get(&entity).copied().unwrap_or_default()
    }

    pub fn total_migrated(&self) -> u64 {
        self.stats.values().map(|s| s.migrated).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.stats.values().map(|s| s.failed).sum()
    }

    pub(crate) fn add_total(&mut self, entity: EntityKind, count: u64) {
        self.stats.entry(entity).or_default().total += count;
    }

    pub(crate) fn record_migrated(&mut self, entity: EntityKind, count: u64) {
        self.stats.entry(entity).or_default().migrated += count;
    }

    /// Count `count` failed records of `entity`, keeping the first error
    pub(crate) fn record_failed(
        &mut self,
        entity: EntityKind,
        count: u64,
        record: impl Into<String>,
        error: &dyn fmt::Display,
    ) {
        let error = RecordError {
            entity,
            record: record.into(),
            message: error.to_string(),
        };
        tracing::error!("Failed to migrate {}", error);
        self.stats.entry(entity).or_default().failed += count;
        self.errors.push(error);
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reason) = &self.skipped {
            return writeln!(f, "Migration skipped: {}", reason);
        }

        writeln!(f, "Migration Statistics:")?;
        writeln!(f, "{}", "=".repeat(50))?;
        for entity in EntityKind::ALL {
            let stats = self.stats_for(entity);
            writeln!(
                f,
                "{:<25} | {:>6}/{:>6} ({:.1}%)",
                entity.label(),
                stats.migrated,
                stats.total,
                stats.success_rate()
            )?;
        }
        writeln!(f, "{}", "=".repeat(50))?;
        writeln!(f, "Total migrated: {}", self.total_migrated())?;
        writeln!(f, "Total failed: {}", self.total_failed())?;

        if !self.verification.is_empty() {
            writeln!(f)?;
            writeln!(f, "Verification:")?;
            for (table, count) in &self.verification {
                writeln!(f, "   {}: {} records", table, count)?;
            }
        }
        if let Some(backup) = &self.backup {
            writeln!(f)?;
            writeln!(f, "Backup: {}", backup.display())?;
        }
        if !self.errors.is_empty() {
            writeln!(f)?;
            writeln!(f, "Errors:")?;
            for (index, error) in self.errors.iter().enumerate() {
                writeln!(f, "   {}. {}", index + 1, error)?;
            }
        }
        Ok(())
    }
}

/// Copy `files` into a fresh `migration-backup/<timestamp>/` under `source_dir`
///
/// Missing files are skipped. Any failure is logged and yields `None`; a
/// migration never stops because its backup could not be written.
pub fn create_backup(source_dir: &Path, files: &[PathBuf]) -> Option<PathBuf> {
    let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string();
    let target = source_dir.join(BACKUP_DIR).join(stamp);

    let copy_all = || -> std::io::Result<usize> {
        std::fs::create_dir_all(&target)?;
        let mut copied = 0;
        for file in files.iter().filter(|f| f.is_file()) {
            if let Some(name) = file.file_name() {
                std::fs::copy(file, target.join(name))?;
                copied += 1;
            }
        }
        Ok(copied)
    };

    match copy_all() {
        Ok(copied) => {
            info!("Backed up {} files to {}", copied, target.display());
            Some(target)
        }
        Err(e) => {
            warn!("Could not create backup in {}: {}", target.display(), e);
            None
        }
    }
}

/// Rewrite the date fields of a source document into canonical form
///
/// Absent and null fields are left alone.
pub(crate) fn normalize_fields(
    document: &mut Document,
    instants: &[&str],
    days: &[&str],
) -> Result<(), DomainError> {
    for field in instants {
        if let Some(value) = document.get_mut(*field).filter(|v| !v.is_null()) {
            *value = Value::String(normalize_instant(value)?);
        }
    }
    for field in days {
        if let Some(value) = document.get_mut(*field).filter(|v| !v.is_null()) {
            *value = Value::String(normalize_day(value)?);
        }
    }
    Ok(())
}

/// Prepare a legacy app usage document for a typed read
///
/// Drops the source id, clamps negative time and rejects hours outside 0-23.
pub(crate) fn prepare_app_usage(mut document: Document) -> Result<Document, DomainError> {
    document.remove("_id");
    normalize_fields(&mut document, &["createdAt", "updatedAt"], &["date"])?;

    if let Some(hour) = document.get("hour").filter(|v| !v.is_null()) {
        let valid = hour.as_i64().filter(|h| (0..=23).contains(h));
        if valid.is_none() {
            return Err(DomainError::InvalidHour(hour.as_i64().unwrap_or(-1)));
        }
    }
    if document.get("timeSpent").and_then(Value::as_i64).is_some_and(|t| t < 0) {
        document.insert("timeSpent".to_string(), Value::from(0));
    }
    Ok(document)
}

/// Prepare a legacy focus session document for a typed read
///
/// Fills the defaults older documents lack: `date` from `startTime`, status
/// `active`, zero planned duration. UI type aliases are mapped to stored types.
pub(crate) fn prepare_focus_session(mut document: Document) -> Result<Document, DomainError> {
    document.remove("_id");
    normalize_fields(
        &mut document,
        &["startTime", "endTime", "pausedAt", "createdAt", "updatedAt"],
        &["date"],
    )?;

    let start = document
        .get("startTime")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DomainError::validation("Focus session has no start time"))?;
    if document.get("date").map_or(true, Value::is_null) {
        document.insert("date".to_string(), Value::String(normalize_day(&Value::String(start))?));
    }
    if document.get("status").map_or(true, Value::is_null) {
        document.insert("status".to_string(), Value::from("active"));
    }
    if document.get("plannedDuration").map_or(true, Value::is_null) {
        document.insert("plannedDuration".to_string(), Value::from(0));
    }
    if let Some(Value::String(name)) = document.get("type") {
        let mapped = SessionType::from_ui(name).as_str();
        document.insert("type".to_string(), Value::from(mapped));
    }

    if let Some(Value::Array(interruptions)) = document.get_mut("interruptions") {
        for interruption in interruptions.iter_mut() {
            if let Value::Object(fields) = interruption {
                normalize_fields(fields, &["timestamp"], &[])?;
            }
        }
    }
    Ok(document)
}

/// Length of an embedded array field, zero when absent
pub(crate) fn embedded_len(document: &Document, field: &str) -> u64 {
    document
        .get(field)
        .and_then(Value::as_array)
        .map_or(0, |items| items.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn document(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_report_table() {
        let mut report = MigrationReport::default();
        report.add_total(EntityKind::AppUsage, 4);
        report.record_migrated(EntityKind::AppUsage, 3);
        report.record_failed(EntityKind::AppUsage, 1, "record 7", &"bad date");

        assert_eq!(report.total_migrated(), 3);
        assert_eq!(report.total_failed(), 1);
        assert_eq!(report.stats_for(EntityKind::Categories), MigrationStats::default());

        let table = report.to_string();
        assert!(table.contains("appUsage                  |      3/     4 (75.0%)"));
        assert!(table.contains("categories                |      0/     0 (100.0%)"));
        assert!(table.contains("1. appUsage record 7: bad date"));
    }

    #[test]
    fn test_skipped_report() {
        let report = MigrationReport::skipped("nothing to migrate");
        assert_eq!(report.to_string(), "Migration skipped: nothing to migrate\n");
    }

    #[test]
    fn test_backup_copies_existing_files() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("data.json");
        std::fs::write(&present, "{}").unwrap();
        let missing = dir.path().join("categories_data.json");

        let backup = create_backup(dir.path(), &[present, missing]).unwrap();
        assert!(backup.starts_with(dir.path().join(BACKUP_DIR)));
        assert!(backup.join("data.json").is_file());
        assert!(!backup.join("categories_data.json").exists());
    }

    #[test]
    fn test_prepare_app_usage_normalizes_dates() {
        let prepared = prepare_app_usage(document(json!({
            "_id": "abc",
            "date": {"$$date": 1720008000000i64},
            "appName": "code.exe",
            "timeSpent": -5,
            "createdAt": "2024-07-03 12:00:00"
        })))
        .unwrap();

        assert!(!prepared.contains_key("_id"));
        assert_eq!(prepared["date"], json!("2024-07-03"));
        assert_eq!(prepared["timeSpent"], json!(0));
        assert_eq!(prepared["createdAt"], json!("2024-07-03T12:00:00.000Z"));
    }

    #[test]
    fn test_prepare_app_usage_rejects_bad_records() {
        assert!(matches!(
            prepare_app_usage(document(json!({"date": "2024-07-03", "hour": 24}))),
            Err(DomainError::InvalidHour(24))
        ));
        assert!(matches!(
            prepare_app_usage(document(json!({"date": "not a date"}))),
            Err(DomainError::InvalidDate(_))
        ));
    }

    #[test]
    fn test_prepare_focus_session_fills_defaults() {
        let prepared = prepare_focus_session(document(json!({
            "_id": "s1",
            "type": "short-break",
            "startTime": 1720008000000i64,
            "interruptions": [{"timestamp": "2024-07-03T12:05:00Z", "reason": "phone"}]
        })))
        .unwrap();

        assert_eq!(prepared["type"], json!("shortBreak"));
        assert_eq!(prepared["status"], json!("active"));
        assert_eq!(prepared["plannedDuration"], json!(0));
        assert_eq!(prepared["date"], json!("2024-07-03"));
        assert_eq!(prepared["startTime"], json!("2024-07-03T12:00:00.000Z"));
        assert_eq!(
            prepared["interruptions"][0]["timestamp"],
            json!("2024-07-03T12:05:00.000Z")
        );
        assert_eq!(embedded_len(&prepared, "interruptions"), 1);
    }

    #[test]
    fn test_prepare_focus_session_needs_start_time() {
        assert!(prepare_focus_session(document(json!({"type": "focus"}))).is_err());
    }
}
