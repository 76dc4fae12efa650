/// Category and custom mapping management against PostgreSQL
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use deadpool_postgres::Transaction;
use tokio_postgres::Row;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::domain::{
    normalize_category_name, Category, CategoryExport, CategoryImportSummary, CategorySettings,
    CategoryStats, CategoryType, CategoryTypeStat, CategoryWithCounts, CustomCategoryMapping,
    CustomMappings, DomainError,
};
use crate::services::categories::EXPORT_VERSION;
use crate::services::remote::contains_pattern;
use crate::storage::{execute_with_retry, PostgresStore, StorageError};

const UPSERT_CATEGORY: &str = "INSERT INTO categories (name, type) VALUES ($1, $2)
     ON CONFLICT (name) DO UPDATE SET type = EXCLUDED.type, updated_at = NOW()
     RETURNING id, name, type";

const UPSERT_MAPPING: &str = "INSERT INTO custom_category_mappings (app_identifier, custom_category)
     VALUES ($1, $2)
     ON CONFLICT (app_identifier) DO UPDATE SET
         custom_category = EXCLUDED.custom_category,
         updated_at = NOW()";

fn category_from_row(row: &Row) -> Result<Category, StorageError> {
    let id: i64 = row.try_get("id")?;
    let category_type: String = row.try_get("type")?;
    Ok(Category {
        id: Some(id.to_string()),
        name: row.try_get("name")?,
        category_type: category_type.parse()?,
    })
}

fn mapping_from_row(row: &Row) -> Result<CustomCategoryMapping, StorageError> {
    let id: i64 = row.try_get("id")?;
    Ok(CustomCategoryMapping {
        id: Some(id.to_string()),
        app_identifier: row.try_get("app_identifier")?,
        custom_category: row.try_get("custom_category")?,
    })
}

async fn upsert_category(tx: &Transaction<'_>, category: &Category) -> Result<Category, StorageError> {
    let row = tx
        .query_one(UPSERT_CATEGORY, &[&category.name, &category.category_type.as_str()])
        .await?;
    category_from_row(&row)
}

async fn upsert_mapping(tx: &Transaction<'_>, mapping: &CustomCategoryMapping) -> Result<(), StorageError> {
    tx.execute(UPSERT_MAPPING, &[&mapping.app_identifier, &mapping.custom_category])
        .await?;
    Ok(())
}

/// Service for productivity categories and per-app overrides in PostgreSQL
pub struct RemoteCategoriesService {
    store: Arc<PostgresStore>,
    retry: RetryPolicy,
}

impl RemoteCategoriesService {
    pub fn new(store: Arc<PostgresStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Create a category or change the type of an existing one
    pub async fn add_category(
        &self,
        name: &str,
        category_type: CategoryType,
    ) -> Result<Category, StorageError> {
        let category = Category::new(name, category_type)?;
        let category = &category;
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .query(UPSERT_CATEGORY, &[&category.name, &category.category_type.as_str()])
                .await
        })
        .await?;

        let saved = rows
            .first()
            .map(category_from_row)
            .transpose()?
            .ok_or_else(|| StorageError::NotFound {
                entity: "Category",
                id: category.name.clone(),
            })?;
        debug!("Saved category {} as {}", saved.name, saved.category_type);
        Ok(saved)
    }

    /// Replace the productive and distracted lists of the settings screen
    ///
    /// Productive and distracted categories missing from `settings` are
    /// deleted; neutral ones are left alone. Runs as one transaction.
    pub async fn save_categories(&self, settings: &CategorySettings) -> Result<usize, StorageError> {
        let mut wanted = Vec::new();
        for name in &settings.productive {
            wanted.push(Category::new(name, CategoryType::Productive)?);
        }
        for name in &settings.distracted {
            wanted.push(Category::new(name, CategoryType::Distracted)?);
        }
        let wanted = &wanted;

        execute_with_retry(self.store.as_ref(), &self.retry, move || {
            let wanted = wanted.clone();
            self.store.transaction(move |tx| {
                Box::pin(async move {
                    tx.execute(
                        "DELETE FROM categories WHERE type IN ('productive', 'distracted')",
                        &[],
                    )
                    .await?;
                    for category in &wanted {
                        upsert_category(tx, category).await?;
                    }
                    Ok::<_, StorageError>(())
                })
            })
        })
        .await?;

        info!("Categories saved: {} categories processed", wanted.len());
        Ok(wanted.len())
    }

    pub async fn get_categories_for_settings(&self) -> Result<CategorySettings, StorageError> {
        Ok(CategorySettings {
            productive: self.get_categories_by_type(CategoryType::Productive).await?,
            distracted: self.get_categories_by_type(CategoryType::Distracted).await?,
        })
    }

    /// Every category, sorted by type then name
    pub async fn get_all_categories(&self) -> Result<Vec<Category>, StorageError> {
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store
                .query("SELECT id, name, type FROM categories ORDER BY type, name", &[])
        })
        .await?;
        rows.iter().map(category_from_row).collect()
    }

    /// Names of the categories of one type
    pub async fn get_categories_by_type(
        &self,
        category_type: CategoryType,
    ) -> Result<Vec<String>, StorageError> {
        let type_name = category_type.as_str();
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .query(
                    "SELECT name FROM categories WHERE type = $1 ORDER BY name",
                    &[&type_name],
                )
                .await
        })
        .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<_, String>("name")?))
            .collect()
    }

    /// Change a category's type; `false` when no such category exists
    pub async fn update_category(
        &self,
        name: &str,
        category_type: CategoryType,
    ) -> Result<bool, StorageError> {
        let name = normalize_category_name(name)?;
        let (name, type_name) = (&name, category_type.as_str());
        let changed = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .execute(
                    "UPDATE categories SET type = $1, updated_at = NOW() WHERE name = $2",
                    &[&type_name, name],
                )
                .await
        })
        .await?;
        Ok(changed > 0)
    }

    /// Delete a category; `false` when no such category exists
    pub async fn delete_category(&self, name: &str) -> Result<bool, StorageError> {
        let name = normalize_category_name(name)?;
        let name = &name;
        let removed = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .execute("DELETE FROM categories WHERE name = $1", &[name])
                .await
        })
        .await?;
        if removed > 0 {
            info!("Deleted category {}", name);
        }
        Ok(removed > 0)
    }

    /// Categories whose name contains `term`, ignoring case
    pub async fn search_categories(&self, term: &str) -> Result<Vec<Category>, StorageError> {
        let pattern = contains_pattern(term.trim());
        let pattern = &pattern;
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .query(
                    "SELECT id, name, type FROM categories WHERE name ILIKE $1 ORDER BY name",
                    &[pattern],
                )
                .await
        })
        .await?;
        rows.iter().map(category_from_row).collect()
    }

    /// All overrides as app identifier to category
    pub async fn get_custom_category_mappings(&self) -> Result<CustomMappings, StorageError> {
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.query(
                "SELECT app_identifier, custom_category FROM custom_category_mappings",
                &[],
            )
        })
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("app_identifier")?, row.try_get("custom_category")?)))
            .collect()
    }

    /// Replace the whole override set with `mappings` in one transaction
    pub async fn save_custom_category_mappings(
        &self,
        mappings: &CustomMappings,
    ) -> Result<usize, StorageError> {
        let wanted = mappings
            .iter()
            .map(|(app, category)| CustomCategoryMapping::new(app, category))
            .collect::<Result<Vec<_>, DomainError>>()?;
        let wanted = &wanted;

        execute_with_retry(self.store.as_ref(), &self.retry, move || {
            let wanted = wanted.clone();
            self.store.transaction(move |tx| {
                Box::pin(async move {
                    tx.execute("DELETE FROM custom_category_mappings", &[]).await?;
                    for mapping in &wanted {
                        upsert_mapping(tx, mapping).await?;
                    }
                    Ok::<_, StorageError>(())
                })
            })
        })
        .await?;

        info!("Custom mappings saved: {} mappings processed", wanted.len());
        Ok(wanted.len())
    }

    pub async fn add_custom_category_mapping(
        &self,
        app_identifier: &str,
        custom_category: &str,
    ) -> Result<(), StorageError> {
        let mapping = CustomCategoryMapping::new(app_identifier, custom_category)?;
        let mapping = &mapping;
        execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .execute(UPSERT_MAPPING, &[&mapping.app_identifier, &mapping.custom_category])
                .await
        })
        .await?;
        Ok(())
    }

    /// Remove an override; `false` when none existed
    pub async fn remove_custom_category_mapping(&self, app_identifier: &str) -> Result<bool, StorageError> {
        let app_identifier = app_identifier.trim();
        let removed = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .execute(
                    "DELETE FROM custom_category_mappings WHERE app_identifier = $1",
                    &[&app_identifier],
                )
                .await
        })
        .await?;
        Ok(removed > 0)
    }

    /// The category an app is overridden to, if any
    pub async fn get_custom_category_mapping(
        &self,
        app_identifier: &str,
    ) -> Result<Option<String>, StorageError> {
        let app_identifier = app_identifier.trim();
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || async move {
            self.store
                .query(
                    "SELECT custom_category FROM custom_category_mappings WHERE app_identifier = $1",
                    &[&app_identifier],
                )
                .await
        })
        .await?;

        match rows.first() {
            Some(row) => Ok(Some(row.try_get("custom_category")?)),
            None => Ok(None),
        }
    }

    /// Remove every override; returns how many were removed
    pub async fn clear_all_custom_mappings(&self) -> Result<u64, StorageError> {
        let removed = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.execute("DELETE FROM custom_category_mappings", &[])
        })
        .await?;
        info!("Cleared {} custom category mappings", removed);
        Ok(removed)
    }

    /// Categories grouped by type plus the number of overrides
    pub async fn get_category_stats(&self) -> Result<CategoryStats, StorageError> {
        let all = self.get_all_categories().await?;
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store
                .query("SELECT COUNT(*) FROM custom_category_mappings", &[])
        })
        .await?;
        let custom_mappings_count = match rows.first() {
            Some(row) => row.try_get::<_, i64>(0)?.max(0) as u64,
            None => 0,
        };

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
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.query(
                "SELECT c.name, c.type,
                        COUNT(u.id) AS usage_count,
                        COALESCE(SUM(u.time_spent), 0)::BIGINT AS total_time
                 FROM categories c
                 LEFT JOIN app_usage u ON u.category = c.name
                 GROUP BY c.name, c.type
                 ORDER BY c.type, c.name",
                &[],
            )
        })
        .await?;

        rows.iter()
            .map(|row| {
                let category_type: String = row.try_get("type")?;
                Ok(CategoryWithCounts {
                    name: row.try_get("name")?,
                    category_type: category_type.parse()?,
                    usage_count: row.try_get::<_, i64>("usage_count")?.max(0) as u64,
                    total_time: row.try_get("total_time")?,
                })
            })
            .collect()
    }

    /// Dump categories and overrides in the portable export format
    pub async fn export_categories(&self) -> Result<CategoryExport, StorageError> {
        let categories = self.get_all_categories().await?;
        let rows = execute_with_retry(self.store.as_ref(), &self.retry, || {
            self.store.query(
                "SELECT id, app_identifier, custom_category FROM custom_category_mappings
                 ORDER BY app_identifier",
                &[],
            )
        })
        .await?;
        let custom_mappings = rows
            .iter()
            .map(mapping_from_row)
            .collect::<Result<Vec<_>, _>>()?;

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

        let categories = export
            .categories
            .iter()
            .map(|c| Category::new(&c.name, c.category_type))
            .collect::<Result<Vec<_>, DomainError>>()?;
        let mappings = export
            .custom_mappings
            .iter()
            .map(|m| CustomCategoryMapping::new(&m.app_identifier, &m.custom_category))
            .collect::<Result<Vec<_>, DomainError>>()?;
        let (categories, mappings) = (&categories, &mappings);

        let summary = execute_with_retry(self.store.as_ref(), &self.retry, move || {
            let categories = categories.clone();
            let mappings = mappings.clone();
            self.store.transaction(move |tx| {
                Box::pin(async move {
                    tx.execute("DELETE FROM categories", &[]).await?;
                    tx.execute("DELETE FROM custom_category_mappings", &[]).await?;
                    for category in &categories {
                        upsert_category(tx, category).await?;
                    }
                    for mapping in &mappings {
                        upsert_mapping(tx, mapping).await?;
                    }
                    Ok::<_, StorageError>(CategoryImportSummary {
                        categories_imported: categories.len() as u64,
                        mappings_imported: mappings.len() as u64,
                    })
                })
            })
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

    #[test]
    fn test_upserts_resolve_on_natural_keys() {
        assert!(UPSERT_CATEGORY.contains("ON CONFLICT (name)"));
        assert!(UPSERT_MAPPING.contains("ON CONFLICT (app_identifier)"));
    }

    #[test]
    fn test_search_pattern_is_literal() {
        assert_eq!(contains_pattern("co_de"), "%co\\_de%");
    }
}
