/// Category and custom mapping management over a local backend
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::domain::{
    normalize_category_name, Category, CategoryExport, CategoryImportSummary, CategorySettings,
    CategoryStats, CategoryType, CategoryTypeStat, CategoryWithCounts, CustomCategoryMapping,
    CustomMappings, DomainError,
};
use crate::services::{int_field, text_field};
use crate::storage::{
    execute_with_retry, from_document, to_document, BatchWrite, Collection, CollectionStore,
    Document, Filter, FindOptions, GroupSpec, SortOrder, StorageError, Update,
};

const CATEGORIES: Collection = Collection::Categories;
const MAPPINGS: Collection = Collection::CustomCategoryMappings;

/// Version written into category exports
pub const EXPORT_VERSION: &str = "1.0";

fn by_name() -> FindOptions {
    FindOptions::new().sort_by("name", SortOrder::Ascending)
}

fn categories(documents: Vec<Document>) -> Result<Vec<Category>, StorageError> {
    documents.into_iter().map(from_document).collect()
}

/// Service for productivity categories and per-app overrides
pub struct CategoriesService {
    store: Arc<dyn CollectionStore>,
    retry: RetryPolicy,
}

impl CategoriesService {
    pub fn new(store: Arc<dyn CollectionStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Create a category or change the type of an existing one
    ///
    /// The name is normalized first, so `"code"` and `"Code"` are the same
    /// category. Calling this twice with the same arguments stores one row.
    pub async fn add_category(
        &self,
        name: &str,
        category_type: CategoryType,
    ) -> Result<Category, StorageError> {
        let category = Category::new(name, category_type)?;
        let category = &category;
        execute_with_retry(self.store.as_ref(), &self.retry, move || self.upsert_category(category))
            .await
    }

    async fn upsert_category(&self, category: &Category) -> Result<Category, StorageError> {
        let filter = Filter::new().eq("name", category.name.clone());
        let update = Update::new().set("type", category.category_type.as_str());

        if self.store.update(CATEGORIES, &filter, &update, false).await? > 0 {
            debug!("Updated category {} to {}", category.name, category.category_type);
        } else {
            match self.store.insert(CATEGORIES, to_document(category)?).await {
                Ok(_) => debug!("Added category {}", category.name),
                Err(StorageError::DuplicateKey { .. }) => {
                    // Inserted concurrently; apply the type on top
                    self.store.update(CATEGORIES, &filter, &update, false).await?;
                }
                Err(e) => return Err(e),
            }
        }

        match self.store.find_one(CATEGORIES, &filter).await? {
            Some(document) => from_document(document),
            None => Err(StorageError::NotFound {
                entity: "Category",
                id: category.name.clone(),
            }),
        }
    }

    /// Store the settings screen's productive and distracted lists
    ///
    /// Categories not listed keep their current type. Returns how many names
    /// were processed.
    pub async fn save_categories(&self, settings: &CategorySettings) -> Result<usize, StorageError> {
        let mut wanted = Vec::new();
        for name in &settings.productive {
            wanted.push(Category::new(name, CategoryType::Productive)?);
        }
        for name in &settings.distracted {
            wanted.push(Category::new(name, CategoryType::Distracted)?);
        }

        let wanted = &wanted;
        execute_with_retry(self.store.as_ref(), &self.retry, move || async move {
            for category in wanted {
                self.upsert_category(category).await?;
            }
            Ok(())
        })
        .await?;

        info!("Categories saved: {} categories processed", wanted.len());
        Ok(wanted.len())
    }

    /// Productive and distracted category names, each sorted by name
    pub async fn get_categories_for_settings(&self) -> Result<CategorySettings, StorageError> {
        Ok(CategorySettings {
            productive: self.get_categories_by_type(CategoryType::Productive).await?,
            distracted: self.get_categories_by_type(CategoryType::Distracted).await?,
        })
    }

    /// Every category, sorted by type then name
    pub async fn get_all_categories(&self) -> Result<Vec<Category>, StorageError> {
        let options = FindOptions::new()
            .sort_by("type", SortOrder::Ascending)
            .sort_by("name", SortOrder::Ascending);
        let filter = Filter::new();
        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find(CATEGORIES, &filter, &options)
        })
        .await?;
        categories(found)
    }

    /// Names of the categories of one type
    pub async fn get_categories_by_type(
        &self,
        category_type: CategoryType,
    ) -> Result<Vec<String>, StorageError> {
        let filter = Filter::new().eq("type", category_type.as_str());
        let options = by_name();
        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find(CATEGORIES, &filter, &options)
        })
        .await?;
        Ok(categories(found)?.into_iter().map(|c| c.name).collect())
    }

    /// Change a category's type; `false` when no such category exists
    pub async fn update_category(
        &self,
        name: &str,
        category_type: CategoryType,
    ) -> Result<bool, StorageError> {
        let filter = Filter::new().eq("name", normalize_category_name(name)?);
        let update = Update::new().set("type", category_type.as_str());
        let changed = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.update(CATEGORIES, &filter, &update, false)
        })
        .await?;
        Ok(changed > 0)
    }

    /// Delete a category; `false` when no such category exists
    pub async fn delete_category(&self, name: &str) -> Result<bool, StorageError> {
        let filter = Filter::new().eq("name", normalize_category_name(name)?);
        let removed = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.remove(CATEGORIES, &filter, false)
        })
        .await?;
        if removed > 0 {
            info!("Deleted category {}", name.trim());
        }
        Ok(removed > 0)
    }

    /// Categories whose name contains `term`, ignoring case
    pub async fn search_categories(&self, term: &str) -> Result<Vec<Category>, StorageError> {
        let filter = Filter::new().regex("name", &regex::escape(term.trim()), true);
        let options = by_name();
        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find(CATEGORIES, &filter, &options)
        })
        .await?;
        categories(found)
    }

    /// All overrides as app identifier to category
    pub async fn get_custom_category_mappings(&self) -> Result<CustomMappings, StorageError> {
        let filter = Filter::new();
        let options = FindOptions::new();
        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find(MAPPINGS, &filter, &options)
        })
        .await?;

        found
            .into_iter()
            .map(|document| {
                let mapping: CustomCategoryMapping = from_document(document)?;
                Ok((mapping.app_identifier, mapping.custom_category))
            })
            .collect()
    }

    /// Create or replace every override in `mappings`
    ///
    /// Overrides not mentioned are kept. Returns how many were processed.
    pub async fn save_custom_category_mappings(
        &self,
        mappings: &CustomMappings,
    ) -> Result<usize, StorageError> {
        let wanted = mappings
            .iter()
            .map(|(app, category)| CustomCategoryMapping::new(app, category))
            .collect::<Result<Vec<_>, DomainError>>()?;

        let wanted = &wanted;
        execute_with_retry(self.store.as_ref(), &self.retry, move || async move {
            for mapping in wanted {
                self.upsert_mapping(mapping).await?;
            }
            Ok(())
        })
        .await?;

        info!("Custom mappings saved: {} mappings processed", wanted.len());
        Ok(wanted.len())
    }

    /// [`save_custom_category_mappings`](Self::save_custom_category_mappings)
    /// for a payload that has not been typed yet
    ///
    /// Anything but an object of strings is a validation error.
    pub async fn save_custom_category_mappings_json(&self, payload: &Value) -> Result<usize, StorageError> {
        let Value::Object(entries) = payload else {
            return Err(DomainError::validation("Custom category mappings must be a JSON object").into());
        };

        let mut mappings = BTreeMap::new();
        for (app, category) in entries {
            let Value::String(category) = category else {
                return Err(DomainError::validation(format!(
                    "Category for {} must be a string",
                    app
                ))
                .into());
            };
            mappings.insert(app.clone(), category.clone());
        }

        self.save_custom_category_mappings(&mappings).await
    }

    pub async fn add_custom_category_mapping(
        &self,
        app_identifier: &str,
        custom_category: &str,
    ) -> Result<(), StorageError> {
        let mapping = CustomCategoryMapping::new(app_identifier, custom_category)?;
        let mapping = &mapping;
        execute_with_retry(self.store.as_ref(), &self.retry, move || self.upsert_mapping(mapping))
            .await
    }

    async fn upsert_mapping(&self, mapping: &CustomCategoryMapping) -> Result<(), StorageError> {
        let filter = Filter::new().eq("appIdentifier", mapping.app_identifier.clone());
        let update = Update::new().set("customCategory", mapping.custom_category.clone());

        if self.store.update(MAPPINGS, &filter, &update, false).await? > 0 {
            return Ok(());
        }
        match self.store.insert(MAPPINGS, to_document(mapping)?).await {
            Ok(_) => Ok(()),
            Err(StorageError::DuplicateKey { .. }) => {
                self.store.update(MAPPINGS, &filter, &update, false).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove an override; `false` when none existed
    pub async fn remove_custom_category_mapping(&self, app_identifier: &str) -> Result<bool, StorageError> {
        let filter = Filter::new().eq("appIdentifier", app_identifier.trim());
        let removed = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.remove(MAPPINGS, &filter, false)
        })
        .await?;
        Ok(removed > 0)
    }

    /// The category an app is overridden to, if any
    pub async fn get_custom_category_mapping(
        &self,
        app_identifier: &str,
    ) -> Result<Option<String>, StorageError> {
        let filter = Filter::new().eq("appIdentifier", app_identifier.trim());
        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find_one(MAPPINGS, &filter)
        })
        .await?;

        match found {
            Some(document) => {
                let mapping: CustomCategoryMapping = from_document(document)?;
                Ok(Some(mapping.custom_category))
            }
            None => Ok(None),
        }
    }

    /// Remove every override; returns how many were removed
    pub async fn clear_all_custom_mappings(&self) -> Result<u64, StorageError> {
        let filter = Filter::new();
        let removed = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.remove(MAPPINGS, &filter, true)
        })
        .await?;
        info!("Cleared {} custom category mappings", removed);
        Ok(removed)
    }

    /// Categories grouped by type plus the number of overrides
    pub async fn get_category_stats(&self) -> Result<CategoryStats, StorageError> {
        let all = self.get_all_categories().await?;
        let filter = Filter::new();
        let custom_mappings_count = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.count(MAPPINGS, &filter)
        })
        .await?;

        let mut by_type: BTreeMap<CategoryType, Vec<String>> = BTreeMap::new();
        for category in all {
            by_type.entry(category.category_type).or_default().push(category.name);
        }

        Ok(CategoryStats {
            category_stats: by_type
                .into_iter()
                .map(|(category_type, categories)| CategoryTypeStat {
                    category_type,
                    count: categories.len() as u64,
                    categories,
                })
                .collect(),
            custom_mappings_count,
        })
    }

    /// Every category with the number of usage buckets and time filed under it
    pub async fn get_categories_with_counts(&self) -> Result<Vec<CategoryWithCounts>, StorageError> {
        let all = self.get_all_categories().await?;
        let spec = GroupSpec::new(&["category"])
            .count("usageCount")
            .sum("totalTime", "timeSpent");
        let groups = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.aggregate(Collection::AppUsage, &spec)
        })
        .await?;

        let usage: BTreeMap<String, (u64, i64)> = groups
            .iter()
            .map(|group| {
                (
                    text_field(group, "category"),
                    (int_field(group, "usageCount") as u64, int_field(group, "totalTime")),
                )
            })
            .collect();

        Ok(all
            .into_iter()
            .map(|category| {
                let (usage_count, total_time) = usage.get(&category.name).copied().unwrap_or((0, 0));
                CategoryWithCounts {
                    name: category.name,
                    category_type: category.category_type,
                    usage_count,
                    total_time,
                }
            })
            .collect())
    }

    /// Dump categories and overrides in the portable export format
    pub async fn export_categories(&self) -> Result<CategoryExport, StorageError> {
        let categories = self.get_all_categories().await?;
        let filter = Filter::new();
        let options = FindOptions::new();
        let found = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.find(MAPPINGS, &filter, &options)
        })
        .await?;
        let custom_mappings = found
            .into_iter()
            .map(from_document)
            .collect::<Result<Vec<CustomCategoryMapping>, _>>()?;

        Ok(CategoryExport {
            categories,
            custom_mappings,
            export_date: Utc::now(),
            version: EXPORT_VERSION.to_string(),
        })
    }

    /// Replace all categories and overrides with the contents of an export
    pub async fn import_categories(
        &self,
        export: &CategoryExport,
    ) -> Result<CategoryImportSummary, StorageError> {
        if export.version != EXPORT_VERSION {
            warn!("Importing categories from export version {}", export.version);
        }

        // Conflicts are found here, before anything is removed
        let mut names = BTreeSet::new();
        let mut categories = Vec::with_capacity(export.categories.len());
        for entry in &export.categories {
            let category = Category::new(&entry.name, entry.category_type)?;
            if !names.insert(category.name.clone()) {
                return Err(DomainError::validation(format!(
                    "Category {} appears more than once in the import",
                    category.name
                ))
                .into());
            }
            categories.push(to_document(&category)?);
        }

        let mut apps = BTreeSet::new();
        let mut mappings = Vec::with_capacity(export.custom_mappings.len());
        for entry in &export.custom_mappings {
            let mapping = CustomCategoryMapping::new(&entry.app_identifier, &entry.custom_category)?;
            if !apps.insert(mapping.app_identifier.clone()) {
                return Err(DomainError::validation(format!(
                    "Mapping for {} appears more than once in the import",
                    mapping.app_identifier
                ))
                .into());
            }
            mappings.push(to_document(&mapping)?);
        }

        let summary = CategoryImportSummary {
            categories_imported: categories.len() as u64,
            mappings_imported: mappings.len() as u64,
        };

        let mut writes = vec![
            BatchWrite::remove(CATEGORIES, Filter::new(), true),
            BatchWrite::remove(MAPPINGS, Filter::new(), true),
        ];
        writes.extend(
            categories
                .into_iter()
                .map(|document| BatchWrite::insert(CATEGORIES, document)),
        );
        writes.extend(
            mappings
                .into_iter()
                .map(|document| BatchWrite::insert(MAPPINGS, document)),
        );

        let writes = &writes;
        execute_with_retry(self.store.as_ref(), &self.retry, move || {
            self.store.write_batch(writes.clone())
        })
        .await?;

        info!(
            "Imported {} categories and {} custom mappings",
            summary.categories_imported, summary.mappings_imported
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::{DocumentStore, SqliteStore, StorageAdapter};
    use serde_json::json;
    use tempfile::TempDir;

    async fn document_service(dir: &TempDir) -> CategoriesService {
        let store = DocumentStore::new(&StorageConfig::new(dir.path()));
        store.connect().await.unwrap();
        CategoriesService::new(Arc::new(store), RetryPolicy::default())
    }

    async fn sqlite_service(dir: &TempDir) -> CategoriesService {
        let store = SqliteStore::new(&StorageConfig::new(dir.path()));
        store.connect().await.unwrap();
        CategoriesService::new(Arc::new(store), RetryPolicy::default())
    }

    #[tokio::test]
    async fn test_add_category_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let service = sqlite_service(&dir).await;

        service.add_category("Code", CategoryType::Productive).await.unwrap();
        service.add_category("Code", CategoryType::Productive).await.unwrap();

        let code: Vec<Category> = service
            .get_all_categories()
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.name == "Code")
            .collect();
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].category_type, CategoryType::Productive);
    }

    #[tokio::test]
    async fn test_add_category_normalizes_and_updates_type() {
        let dir = TempDir::new().unwrap();
        let service = document_service(&dir).await;

        let added = service.add_category("  reading ", CategoryType::Neutral).await.unwrap();
        assert_eq!(added.name, "Reading");
        assert!(added.id.is_some());

        let changed = service.add_category("reading", CategoryType::Productive).await.unwrap();
        assert_eq!(changed.id, added.id);
        assert_eq!(changed.category_type, CategoryType::Productive);

        assert!(service.add_category("   ", CategoryType::Neutral).await.is_err());
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let dir = TempDir::new().unwrap();
        let service = sqlite_service(&dir).await;

        let saved = service
            .save_categories(&CategorySettings {
                productive: vec!["Writing".to_string(), "Code".to_string()],
                distracted: vec!["Social".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(saved, 3);

        let settings = service.get_categories_for_settings().await.unwrap();
        assert_eq!(settings.productive, vec!["Code", "Writing"]);
        assert_eq!(settings.distracted, vec!["Entertainment", "Social"]);
    }

    #[tokio::test]
    async fn test_update_delete_and_search() {
        let dir = TempDir::new().unwrap();
        let service = document_service(&dir).await;

        assert!(service.update_category("browsing", CategoryType::Distracted).await.unwrap());
        assert!(!service.update_category("Nope", CategoryType::Distracted).await.unwrap());
        assert_eq!(
            service.get_categories_by_type(CategoryType::Distracted).await.unwrap(),
            vec!["Browsing", "Entertainment"]
        );

        let found = service.search_categories("COMM").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Communication");

        // Regex metacharacters are matched literally
        assert!(service.search_categories("c.de").await.unwrap().is_empty());

        assert!(service.delete_category("Utilities").await.unwrap());
        assert!(!service.delete_category("Utilities").await.unwrap());
    }

    #[tokio::test]
    async fn test_custom_mappings() {
        let dir = TempDir::new().unwrap();
        let service = sqlite_service(&dir).await;

        let mut mappings = CustomMappings::new();
        mappings.insert("slack.exe".to_string(), "Communication".to_string());
        mappings.insert("figma.exe".to_string(), "Design".to_string());
        assert_eq!(service.save_custom_category_mappings(&mappings).await.unwrap(), 2);

        service.add_custom_category_mapping("figma.exe", "Code").await.unwrap();
        assert_eq!(
            service.get_custom_category_mapping("figma.exe").await.unwrap().as_deref(),
            Some("Code")
        );
        assert_eq!(service.get_custom_category_mappings().await.unwrap().len(), 2);

        assert!(service.remove_custom_category_mapping("slack.exe").await.unwrap());
        assert_eq!(service.get_custom_category_mapping("slack.exe").await.unwrap(), None);
        assert_eq!(service.clear_all_custom_mappings().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mapping_payload_must_be_an_object() {
        let dir = TempDir::new().unwrap();
        let service = document_service(&dir).await;

        for payload in [json!(["slack.exe"]), json!("slack.exe"), json!({ "slack.exe": 3 })] {
            assert!(matches!(
                service.save_custom_category_mappings_json(&payload).await,
                Err(StorageError::Validation(DomainError::Validation { .. }))
            ));
        }

        let saved = service
            .save_custom_category_mappings_json(&json!({ "slack.exe": "Communication" }))
            .await
            .unwrap();
        assert_eq!(saved, 1);
    }

    #[tokio::test]
    async fn test_stats_and_counts() {
        let dir = TempDir::new().unwrap();
        let service = document_service(&dir).await;
        service.add_custom_category_mapping("code.exe", "Code").await.unwrap();

        let stats = service.get_category_stats().await.unwrap();
        assert_eq!(stats.custom_mappings_count, 1);
        let neutral = stats
            .category_stats
            .iter()
            .find(|s| s.category_type == CategoryType::Neutral)
            .unwrap();
        assert_eq!(neutral.count, 4);

        let counts = service.get_categories_with_counts().await.unwrap();
        assert_eq!(counts.len(), 6);
        assert!(counts.iter().all(|c| c.usage_count == 0 && c.total_time == 0));
    }

    #[tokio::test]
    async fn test_export_then_import_resets() {
        let dir = TempDir::new().unwrap();
        let service = sqlite_service(&dir).await;
        service.add_custom_category_mapping("code.exe", "Code").await.unwrap();

        let mut export = service.export_categories().await.unwrap();
        assert_eq!(export.version, EXPORT_VERSION);
        assert_eq!(export.categories.len(), 6);
        assert_eq!(export.custom_mappings.len(), 1);

        export.categories.truncate(2);
        service.add_category("Extra", CategoryType::Neutral).await.unwrap();

        let summary = service.import_categories(&export).await.unwrap();
        assert_eq!(summary.categories_imported, 2);
        assert_eq!(summary.mappings_imported, 1);
        assert_eq!(service.get_all_categories().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_import_with_duplicate_names_keeps_existing_categories() {
        for sqlite in [false, true] {
            let dir = TempDir::new().unwrap();
            let service = if sqlite {
                sqlite_service(&dir).await
            } else {
                document_service(&dir).await
            };
            service.add_custom_category_mapping("code.exe", "Code").await.unwrap();

            let mut export = service.export_categories().await.unwrap();
            export.categories = vec![
                Category::new("Code", CategoryType::Productive).unwrap(),
                Category {
                    id: None,
                    name: " code ".to_string(),
                    category_type: CategoryType::Neutral,
                },
            ];

            let result = service.import_categories(&export).await;
            assert!(matches!(
                result,
                Err(StorageError::Validation(DomainError::Validation { .. }))
            ));
            assert_eq!(service.get_all_categories().await.unwrap().len(), 6, "sqlite: {}", sqlite);
            assert_eq!(service.get_custom_category_mappings().await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_failed_import_write_keeps_existing_categories() {
        let quick = RetryPolicy::new(2, std::time::Duration::from_millis(1));

        // Document store: the mappings file cannot be rewritten
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::new(&StorageConfig::new(dir.path()));
        store.connect().await.unwrap();
        let service = CategoriesService::new(Arc::new(store), quick);
        service.add_custom_category_mapping("code.exe", "Code").await.unwrap();
        let mut export = service.export_categories().await.unwrap();
        export.categories.truncate(2);
        std::fs::create_dir(dir.path().join("customCategoryMappings.db~")).unwrap();

        let result = service.import_categories(&export).await;
        assert!(matches!(result.unwrap_err().root(), StorageError::Io(_)));
        assert_eq!(service.get_all_categories().await.unwrap().len(), 6);
        assert_eq!(service.get_custom_category_mappings().await.unwrap().len(), 1);

        // SQLite: inserting the mapping aborts the transaction
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::new(dir.path());
        let store = SqliteStore::new(&config);
        store.connect().await.unwrap();
        let service = CategoriesService::new(Arc::new(store), quick);
        service.add_custom_category_mapping("code.exe", "Code").await.unwrap();
        let mut export = service.export_categories().await.unwrap();
        export.categories.truncate(2);

        let conn = rusqlite::Connection::open(config.sqlite_path()).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_mappings BEFORE INSERT ON custom_category_mappings
             BEGIN SELECT RAISE(ABORT, 'mappings are read-only'); END;",
        )
        .unwrap();

        assert!(service.import_categories(&export).await.is_err());
        assert_eq!(service.get_all_categories().await.unwrap().len(), 6);
        assert_eq!(service.get_custom_category_mappings().await.unwrap().len(), 1);
    }
}
