/// Document store to SQLite migration
///
/// Reads every collection of the document store and writes it through the
/// SQLite shim. Source ids are dropped so SQLite assigns integer row ids;
/// embedded timestamps and interruptions land in their child tables.
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::domain::{AppUsageRecord, Category, CustomCategoryMapping, FocusSession};
use crate::migration::{
    create_backup, embedded_len, prepare_app_usage, prepare_focus_session, EntityKind,
    MigrationError, MigrationReport,
};
use crate::storage::{
    document_id, from_document, to_document, Collection, CollectionStore, Document, DocumentStore,
    Filter, FindOptions, SortOrder, SqliteStore, StorageAdapter, StorageError, Update,
};

/// Read a prepared document as `T` and write it back out, keeping its
/// audit stamps
fn typed<T: Serialize + DeserializeOwned>(prepared: Document) -> Result<Document, StorageError> {
    let audit: Vec<(String, Value)> = ["createdAt", "updatedAt"]
        .iter()
        .filter_map(|field| {
            prepared
                .get(*field)
                .filter(|v| !v.is_null())
                .map(|v| (field.to_string(), v.clone()))
        })
        .collect();

    let value: T = from_document(prepared)?;
    let mut document = to_document(&value)?;
    document.extend(audit);
    Ok(document)
}

/// How a source record is named in the report
fn describe(document: &Document, fallback: &str) -> String {
    document_id(document).unwrap_or_else(|| fallback.to_string())
}

/// Moves the document store's data into the SQLite database next to it
pub struct DocumentToSqliteMigration {
    source: DocumentStore,
    destination: SqliteStore,
    data_dir: PathBuf,
    force: bool,
}

impl DocumentToSqliteMigration {
    /// Both stores are opened from `config`: the collection files and
    /// `focusbook.db` in the same data directory
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            source: DocumentStore::new(config),
            destination: SqliteStore::new(config),
            data_dir: config.data_dir.clone(),
            force: false,
        }
    }

    /// Migrate even when the SQLite database already holds app usage
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Run every stage; both stores are closed again whatever happens
    pub async fn run(&self) -> Result<MigrationReport, MigrationError> {
        info!("Starting document store to SQLite migration");
        let result = self.run_connected().await;

        if let Err(e) = self.source.disconnect().await {
            warn!("Error closing document store: {}", e);
        }
        if let Err(e) = self.destination.disconnect().await {
            warn!("Error closing SQLite database: {}", e);
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
        self.source.connect().await.map_err(MigrationError::Connection)?;
        self.destination.connect().await.map_err(MigrationError::Connection)?;
        info!("Document store and SQLite connections established");

        if let Some(reason) = self.skip_reason().await? {
            return Ok(MigrationReport::skipped(reason));
        }

        let mut report = MigrationReport::default();
        let files: Vec<PathBuf> = Collection::ALL
            .iter()
            .map(|c| self.source.file_path(*c))
            .collect();
        report.backup = create_backup(&self.data_dir, &files);

        self.migrate_categories(&mut report).await?;
        self.migrate_custom_mappings(&mut report).await?;
        self.migrate_app_usage(&mut report).await?;
        self.migrate_focus_sessions(&mut report).await?;

        report.verification = self
            .destination
            .get_stats()
            .await
            .map_err(MigrationError::Verification)?
            .collections;
        Ok(report)
    }

    async fn skip_reason(&self) -> Result<Option<String>, MigrationError> {
        let everything = Filter::new();
        let source_usage = self.source.count(Collection::AppUsage, &everything).await?;
        let source_sessions = self.source.count(Collection::FocusSessions, &everything).await?;
        let source_mappings = self
            .source
            .count(Collection::CustomCategoryMappings, &everything)
            .await?;
        let destination_usage = self.destination.count(Collection::AppUsage, &everything).await?;

        info!("Document store app usage records: {}", source_usage);
        info!("SQLite app usage records: {}", destination_usage);

        if source_usage == 0 && source_sessions == 0 && source_mappings == 0 {
            return Ok(Some("document store has no data to migrate".to_string()));
        }
        if source_usage > 0 && destination_usage > 0 && !self.force {
            return Ok(Some(
                "SQLite database already contains app usage; rerun with --force to migrate anyway"
                    .to_string(),
            ));
        }
        Ok(None)
    }

    async fn read_all(
        &self,
        stage: EntityKind,
        collection: Collection,
        options: &FindOptions,
    ) -> Result<Vec<Document>, MigrationError> {
        self.source
            .find(collection, &Filter::new(), options)
            .await
            .map_err(|source| MigrationError::Stage { stage, source })
    }

    /// Categories already in SQLite (the seeded defaults) take the source type
    async fn migrate_categories(&self, report: &mut MigrationReport) -> Result<(), MigrationError> {
        let stage = EntityKind::Categories;
        let documents = self.read_all(stage, Collection::Categories, &FindOptions::new()).await?;
        report.add_total(stage, documents.len() as u64);

        for document in documents {
            let name = describe(&document, "category");
            let result = async {
                let source: Category = from_document(document)?;
                let category = Category::new(&source.name, source.category_type)?;
                let filter = Filter::new().eq("name", category.name.clone());
                let update = Update::new().set("type", category.category_type.as_str());
                if self.destination.update(Collection::Categories, &filter, &update, false).await? == 0 {
                    self.destination
                        .insert(Collection::Categories, to_document(&category)?)
                        .await?;
                }
                Ok::<_, StorageError>(())
            }
            .await;

            match result {
                Ok(()) => report.record_migrated(stage, 1),
                Err(e) => report.record_failed(stage, 1, name, &e),
            }
        }

        info!("Categories migration: {:?}", report.stats_for(stage));
        Ok(())
    }

    async fn migrate_custom_mappings(&self, report: &mut MigrationReport) -> Result<(), MigrationError> {
        let stage = EntityKind::CustomCategoryMappings;
        let documents = self
            .read_all(stage, Collection::CustomCategoryMappings, &FindOptions::new())
            .await?;
        report.add_total(stage, documents.len() as u64);

        for document in documents {
            let name = describe(&document, "mapping");
            let result = async {
                let source: CustomCategoryMapping = from_document(document)?;
                let mapping = CustomCategoryMapping::new(&source.app_identifier, &source.custom_category)?;
                let filter = Filter::new().eq("appIdentifier", mapping.app_identifier.clone());
                let update = Update::new().set("customCategory", mapping.custom_category.clone());
                if self
                    .destination
                    .update(Collection::CustomCategoryMappings, &filter, &update, false)
                    .await?
                    == 0
                {
                    self.destination
                        .insert(Collection::CustomCategoryMappings, to_document(&mapping)?)
                        .await?;
                }
                Ok::<_, StorageError>(())
            }
            .await;

            match result {
                Ok(()) => report.record_migrated(stage, 1),
                Err(e) => report.record_failed(stage, 1, name, &e),
            }
        }

        info!("Custom mappings migration: {:?}", report.stats_for(stage));
        Ok(())
    }

    async fn migrate_app_usage(&self, report: &mut MigrationReport) -> Result<(), MigrationError> {
        let stage = EntityKind::AppUsage;
        let options = FindOptions::new().sort_by("date", SortOrder::Ascending);
        let documents = self.read_all(stage, Collection::AppUsage, &options).await?;
        report.add_total(stage, documents.len() as u64);

        for (processed, document) in documents.into_iter().enumerate() {
            let name = describe(&document, "app usage record");
            let timestamps = embedded_len(&document, "timestamps");
            report.add_total(EntityKind::Timestamps, timestamps);

            let result = async {
                let prepared = typed::<AppUsageRecord>(prepare_app_usage(document)?)?;
                self.destination.insert(Collection::AppUsage, prepared).await?;
                Ok::<_, StorageError>(())
            }
            .await;

            match result {
                Ok(()) => {
                    report.record_migrated(stage, 1);
                    report.record_migrated(EntityKind::Timestamps, timestamps);
                }
                Err(e) => {
                    report.record_failed(stage, 1, name, &e);
                    report.stats.entry(EntityKind::Timestamps).or_default().failed += timestamps;
                }
            }

            if (processed + 1) % 100 == 0 {
                info!("Processed {} app usage records", processed + 1);
            }
        }

        info!("App usage migration: {:?}", report.stats_for(stage));
        Ok(())
    }

    async fn migrate_focus_sessions(&self, report: &mut MigrationReport) -> Result<(), MigrationError> {
        let stage = EntityKind::FocusSessions;
        let options = FindOptions::new().sort_by("startTime", SortOrder::Ascending);
        let documents = self.read_all(stage, Collection::FocusSessions, &options).await?;
        report.add_total(stage, documents.len() as u64);

        for document in documents {
            let name = describe(&document, "focus session");
            let interruptions = embedded_len(&document, "interruptions");
            report.add_total(EntityKind::Interruptions, interruptions);

            let result = async {
                let prepared = typed::<FocusSession>(prepare_focus_session(document)?)?;
                self.destination.insert(Collection::FocusSessions, prepared).await?;
                Ok::<_, StorageError>(())
            }
            .await;

            match result {
                Ok(()) => {
                    report.record_migrated(stage, 1);
                    report.record_migrated(EntityKind::Interruptions, interruptions);
                }
                Err(e) => {
                    report.record_failed(stage, 1, name, &e);
                    report.stats.entry(EntityKind::Interruptions).or_default().failed += interruptions;
                }
            }
        }

        info!("Focus sessions migration: {:?}", report.stats_for(stage));
        Ok(())
    }
}
