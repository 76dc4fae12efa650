/// Legacy JSON files to PostgreSQL migration
///
/// Imports `categories_data.json`, `custom-categories.json` and `data.json`
/// from the old JSON data directory. Each app usage bucket is written in its
/// own transaction so one bad bucket cannot roll back the others. A
/// `migration_completed` marker in `app_metadata` keeps the import from
/// running twice.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::domain::{day_from_value, parse_hour_key, AppUsageEntry, AppUsageRecord, CategoryType};
use crate::migration::{create_backup, EntityKind, MigrationError, MigrationReport};
use crate::services::remote::{RemoteAppUsageService, RemoteCategoriesService};
use crate::storage::{execute_with_retry, PostgresStore, StorageAdapter, StorageError};

pub const APP_USAGE_FILE: &str = "data.json";
pub const CATEGORIES_FILE: &str = "categories_data.json";
pub const CUSTOM_CATEGORIES_FILE: &str = "custom-categories.json";

/// One app entry of `data.json`, parsed or with the reason it could not be
struct LegacyEntry {
    label: String,
    timestamps: u64,
    record: Result<AppUsageRecord, String>,
}

/// Flatten the `data.json` layout (`{day: {apps: {...}, "HH:00": {...}}}`)
/// into one entry per app bucket
///
/// Keys other than `apps` and `HH:MM` inside a day are ignored.
fn legacy_usage_entries(data: &Map<String, Value>) -> Vec<LegacyEntry> {
    let mut entries = Vec::new();

    for (day, usage) in data {
        let date: Result<NaiveDate, String> =
            day_from_value(&Value::String(day.clone())).map_err(|e| e.to_string());

        let Some(buckets) = usage.as_object() else {
            entries.push(LegacyEntry {
                label: day.clone(),
                timestamps: 0,
                record: Err("day is not a JSON object".to_string()),
            });
            continue;
        };

        for (key, apps) in buckets {
            let hour = if key == "apps" {
                None
            } else if let Some(hour) = parse_hour_key(key) {
                Some(hour)
            } else {
                debug!("Ignoring key {} in day {}", key, day);
                continue;
            };

            let Some(apps) = apps.as_object() else {
                entries.push(LegacyEntry {
                    label: format!("{} {}", day, key),
                    timestamps: 0,
                    record: Err("bucket is not a JSON object".to_string()),
                });
                continue;
            };

            for (app, entry) in apps {
                let timestamps = entry
                    .get("timestamps")
                    .and_then(Value::as_array)
                    .map_or(0, |items| items.len() as u64);
                let record = date.clone().and_then(|date| {
                    serde_json::from_value::<AppUsageEntry>(entry.clone())
                        .map(|parsed| parsed.to_record(date, hour, app))
                        .map_err(|e| e.to_string())
                });
                entries.push(LegacyEntry {
                    label: format!("{} {} {}", day, key, app),
                    timestamps,
                    record,
                });
            }
        }
    }

    entries
}

/// Category names from `categories_data.json`, with their type
fn legacy_categories(data: &Map<String, Value>) -> Vec<(Value, CategoryType)> {
    [
        ("productive", CategoryType::Productive),
        ("distracted", CategoryType::Distracted),
    ]
    .into_iter()
    .flat_map(|(key, category_type)| {
        data.get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(move |name| (name, category_type))
    })
    .collect()
}

/// Read a JSON file; `None` when it does not exist
fn load_json(path: &Path) -> Result<Option<Value>, MigrationError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path).map_err(|source| MigrationError::Source {
        path: path.to_path_buf(),
        source,
    })?;
    let value = serde_json::from_str(&text).map_err(|source| MigrationError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Loaded {}", path.display());
    Ok(Some(value))
}

/// Top-level object of a legacy file; anything else counts as absent
fn object(value: Option<Value>, path: &Path) -> Option<Map<String, Value>> {
    match value {
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            warn!("{} does not hold a JSON object, ignoring it", path.display());
            None
        }
        None => None,
    }
}

/// Imports the legacy JSON files into PostgreSQL
pub struct JsonToPostgresMigration {
    store: Arc<PostgresStore>,
    json_dir: PathBuf,
    retry: RetryPolicy,
    force: bool,
}

impl JsonToPostgresMigration {
    pub fn new(store: PostgresStore, json_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: Arc::new(store),
            json_dir: json_dir.into(),
            retry: RetryPolicy::default(),
            force: false,
        }
    }

    /// Import again even when the database says it already was
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn path(&self, file: &str) -> PathBuf {
        self.json_dir.join(file)
    }

    /// Run every stage; the pool is closed again whatever happens
    pub async fn run(&self) -> Result<MigrationReport, MigrationError> {
        info!("Starting JSON to PostgreSQL migration from {}", self.json_dir.display());
        let result = self.run_connected().await;

        if let Err(e) = self.store.disconnect().await {
            warn!("Error closing PostgreSQL connection: {}", e);
        }

        match &result {
            Ok(report) if report.skipped.is_none() => info!(
                "Migration finished: {} migrated, {} failed",
                report.total_migrated(),
                report.total_failed()
            ),
            Ok(_) => {}
            Err(e) => tracing::error!("Migration failed: {}", e),
        }
        result
    }

    async fn run_connected(&self) -> Result<MigrationReport, MigrationError> {
        self.store.connect().await.map_err(MigrationError::Connection)?;
        info!("PostgreSQL connection established ({})", self.store.config().location());

        if !self.force && self.store.is_migration_completed().await? {
            return Ok(MigrationReport::skipped("migration already completed"));
        }

        let usage_path = self.path(APP_USAGE_FILE);
        let categories_path = self.path(CATEGORIES_FILE);
        let custom_path = self.path(CUSTOM_CATEGORIES_FILE);

        let usage = object(load_json(&usage_path)?, &usage_path);
        let categories = object(load_json(&categories_path)?, &categories_path);
        let custom = object(load_json(&custom_path)?, &custom_path);

        if usage.is_none() && categories.is_none() && custom.is_none() {
            self.store.mark_migration_completed().await?;
            return Ok(MigrationReport::skipped("no JSON data found to migrate"));
        }

        if !self.force && usage.as_ref().is_some_and(|u| !u.is_empty()) {
            let rows = self.store.query("SELECT COUNT(*) FROM app_usage", &[]).await?;
            let existing: i64 = match rows.first() {
                Some(row) => row.try_get(0).map_err(StorageError::from)?,
                None => 0,
            };
            if existing > 0 {
                return Ok(MigrationReport::skipped(
                    "PostgreSQL database already contains app usage; rerun with --force to migrate anyway",
                ));
            }
        }

        let mut report = MigrationReport::default();
        report.backup = create_backup(&self.json_dir, &[usage_path, categories_path, custom_path]);

        if let Some(categories) = &categories {
            self.migrate_categories(categories, &mut report).await;
        }
        if let Some(custom) = &custom {
            self.migrate_custom_mappings(custom, &mut report).await;
        }
        if let Some(usage) = &usage {
            self.migrate_app_usage(usage, &mut report).await;
        }

        report.verification = self
            .store
            .get_stats()
            .await
            .map_err(MigrationError::Verification)?
            .collections;
        self.store.mark_migration_completed().await?;
        Ok(report)
    }

    async fn migrate_categories(&self, data: &Map<String, Value>, report: &mut MigrationReport) {
        let stage = EntityKind::Categories;
        let service = RemoteCategoriesService::new(self.store.clone(), self.retry);
        let wanted = legacy_categories(data);
        report.add_total(stage, wanted.len() as u64);

        for (name, category_type) in wanted {
            let Some(name) = name.as_str() else {
                report.record_failed(stage, 1, name.to_string(), &"category name is not a string");
                continue;
            };
            match service.add_category(name, category_type).await {
                Ok(_) => report.record_migrated(stage, 1),
                Err(e) => report.record_failed(stage, 1, name, &e),
            }
        }
        info!("Categories migration: {:?}", report.stats_for(stage));
    }

    async fn migrate_custom_mappings(&self, data: &Map<String, Value>, report: &mut MigrationReport) {
        let stage = EntityKind::CustomCategoryMappings;
        let service = RemoteCategoriesService::new(self.store.clone(), self.retry);
        report.add_total(stage, data.len() as u64);

        for (app, category) in data {
            let Some(category) = category.as_str() else {
                report.record_failed(stage, 1, app.as_str(), &"category is not a string");
                continue;
            };
            match service.add_custom_category_mapping(app, category).await {
                Ok(()) => report.record_migrated(stage, 1),
                Err(e) => report.record_failed(stage, 1, app.as_str(), &e),
            }
        }
        info!("Custom mappings migration: {:?}", report.stats_for(stage));
    }

    async fn migrate_app_usage(&self, data: &Map<String, Value>, report: &mut MigrationReport) {
        let stage = EntityKind::AppUsage;
        let entries = legacy_usage_entries(data);
        report.add_total(stage, entries.len() as u64);

        for (processed, entry) in entries.into_iter().enumerate() {
            report.add_total(EntityKind::Timestamps, entry.timestamps);

            let result = match entry.record {
                Ok(record) => self.save_record(record).await.map_err(|e| e.to_string()),
                Err(reason) => Err(reason),
            };

            match result {
                Ok(()) => {
                    report.record_migrated(stage, 1);
                    report.record_migrated(EntityKind::Timestamps, entry.timestamps);
                }
                Err(reason) => {
                    report.record_failed(stage, 1, entry.label, &reason);
                    report.stats.entry(EntityKind::Timestamps).or_default().failed += entry.timestamps;
                }
            }

            if (processed + 1) % 100 == 0 {
                info!("Migrated {} app usage records", processed + 1);
            }
        }
        info!("App usage migration: {:?}", report.stats_for(stage));
    }

    async fn save_record(&self, record: AppUsageRecord) -> Result<(), StorageError> {
        let record = &record;
        execute_with_retry(self.store.as_ref(), &self.retry, move || {
            let record = record.clone();
            self.store.transaction(move |tx| {
                Box::pin(async move {
                    RemoteAppUsageService::save_app_usage_in_transaction(tx, &record).await
                })
            })
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_legacy_usage_layout_is_flattened() {
        let data = map(json!({
            "2024-07-03": {
                "apps": {"code.exe": {"time": 8000, "category": "Code"}},
                "11:00": {
                    "code.exe": {
                        "time": 8000,
                        "category": "Code",
                        "timestamps": [{"start": "2024-07-03T11:00:00.000Z", "duration": 8000}]
                    }
                },
                "notes": {"ignored": true}
            }
        }));

        let entries = legacy_usage_entries(&data);
        assert_eq!(entries.len(), 2);

        let daily = entries.iter().find(|e| e.label == "2024-07-03 apps code.exe").unwrap();
        let daily = daily.record.as_ref().unwrap();
        assert_eq!(daily.hour, None);
        assert_eq!(daily.time_spent, 8000);

        let hourly = entries.iter().find(|e| e.label == "2024-07-03 11:00 code.exe").unwrap();
        assert_eq!(hourly.timestamps, 1);
        let hourly = hourly.record.as_ref().unwrap();
        assert_eq!(hourly.hour, Some(11));
        assert_eq!(hourly.timestamps.len(), 1);
    }

    #[test]
    fn test_bad_entries_fail_individually() {
        let data = map(json!({
            "not-a-day": {"apps": {"code.exe": {"time": 1}}},
            "2024-07-04": {
                "apps": {
                    "good.exe": {"time": 1},
                    "bad.exe": {"time": "lots"}
                }
            }
        }));

        let entries = legacy_usage_entries(&data);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.iter().filter(|e| e.record.is_ok()).count(), 1);
        assert!(entries
            .iter()
            .any(|e| e.label == "2024-07-04 apps good.exe" && e.record.is_ok()));
    }

    #[test]
    fn test_legacy_categories_keep_their_type() {
        let data = map(json!({
            "productive": ["Code", "Docs"],
            "distracted": ["Games"],
            "neutral": ["Ignored"]
        }));

        let categories = legacy_categories(&data);
        assert_eq!(
            categories,
            vec![
                (json!("Code"), CategoryType::Productive),
                (json!("Docs"), CategoryType::Productive),
                (json!("Games"), CategoryType::Distracted),
            ]
        );
    }

    #[test]
    fn test_load_json() {
        let dir = TempDir::new().unwrap();
        assert!(load_json(&dir.path().join(APP_USAGE_FILE)).unwrap().is_none());

        let broken = dir.path().join(CATEGORIES_FILE);
        std::fs::write(&broken, "{not json").unwrap();
        assert!(matches!(load_json(&broken), Err(MigrationError::Json { .. })));

        let good = dir.path().join(CUSTOM_CATEGORIES_FILE);
        std::fs::write(&good, r#"{"code.exe": "Code"}"#).unwrap();
        let loaded = object(load_json(&good).unwrap(), &good).unwrap();
        assert_eq!(loaded.get("code.exe"), Some(&json!("Code")));
    }
}
