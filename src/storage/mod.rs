/// Storage layer for persisting tracker data
///
/// Every backend implements [`StorageAdapter`] (lifecycle, health and stats).
/// The two local backends additionally implement [`CollectionStore`], a
/// document-shaped query surface that lets the domain services run unchanged
/// whether the data lives in JSON-lines files or in SQLite tables.
pub mod aggregate;
pub mod document;
pub mod field_map;
pub mod postgres;
pub mod query;
pub mod retry;
pub mod schema;
pub mod sqlite;

// Re-export the main storage types
pub use aggregate::{Accumulator, GroupSpec};
pub use document::DocumentStore;
pub use postgres::PostgresStore;
pub use query::{BatchWrite, Filter, FindOptions, Op, SortOrder, Update, WriteOp};
pub use retry::execute_with_retry;
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::DomainError;

/// A stored document: a JSON object with camelCase field names and an `_id`
pub type Document = serde_json::Map<String, Value>;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database connection lost: {0}")]
    ConnectionLost(String),

    #[error("Storage initialization failed: {0}")]
    Initialization(String),

    #[error("Storage is not connected")]
    NotConnected,

    #[error("Validation error: {0}")]
    Validation(#[from] DomainError),

    #[error("Duplicate key in {collection}: {key}")]
    DuplicateKey { collection: String, key: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid query: {0}")]
    Query(String),

    #[error("Operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Whether running the same operation again could succeed
    ///
    /// Bad input, missing records and key conflicts fail the same way every
    /// time, so they are surfaced immediately instead of being retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StorageError::Validation(_)
                | StorageError::DuplicateKey { .. }
                | StorageError::NotFound { .. }
                | StorageError::Serialization(_)
                | StorageError::Schema(_)
                | StorageError::Query(_)
                | StorageError::RetriesExhausted { .. }
        )
    }

    /// The error underneath any retry wrapper
    pub fn root(&self) -> &StorageError {
        match self {
            StorageError::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// The four logical collections every local backend stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    AppUsage,
    Categories,
    CustomCategoryMappings,
    FocusSessions,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::AppUsage,
        Collection::Categories,
        Collection::CustomCategoryMappings,
        Collection::FocusSessions,
    ];

    /// Name used by the document store and in reports
    pub fn name(&self) -> &'static str {
        match self {
            Collection::AppUsage => "appUsage",
            Collection::Categories => "categories",
            Collection::CustomCategoryMappings => "customCategoryMappings",
            Collection::FocusSessions => "focusSessions",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which engine sits behind an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageKind {
    DocumentStore,
    Sqlite,
    Postgres,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageKind::DocumentStore => "document-store",
            StorageKind::Sqlite => "sqlite",
            StorageKind::Postgres => "postgres",
        };
        f.write_str(name)
    }
}

/// Backend description with per-collection (or per-table) row counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub backend: StorageKind,
    pub location: String,
    pub collections: BTreeMap<String, u64>,
}

/// Lifecycle contract shared by every backend
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Which engine this adapter drives
    fn kind(&self) -> StorageKind;

    /// Open the backend; safe to call when already connected
    async fn connect(&self) -> Result<(), StorageError>;

    /// Release the backend's resources
    async fn disconnect(&self) -> Result<(), StorageError>;

    fn is_connected(&self) -> bool;

    /// Cheap liveness probe; reports failure as `false` instead of an error
    async fn health_check(&self) -> bool;

    /// Seed the data a fresh install needs; does nothing the second time
    async fn initialize_default_data(&self) -> Result<(), StorageError>;

    async fn get_stats(&self) -> Result<StorageStats, StorageError>;
}

/// Document-shaped query surface implemented by the local backends
///
/// Documents use logical (camelCase) field names and carry their identifier
/// as a string under `_id`, whatever the backend stores physically.
#[async_trait]
pub trait CollectionStore: StorageAdapter {
    /// All documents matching `filter`, sorted and paged per `options`
    async fn find(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StorageError>;

    /// First document matching `filter`
    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>, StorageError> {
        let mut found = self
            .find(collection, filter, &FindOptions::new().limit(1))
            .await?;
        Ok(found.pop())
    }

    /// Store a new document, stamping `createdAt`/`updatedAt`
    ///
    /// Returns the document as stored, including its `_id`.
    async fn insert(&self, collection: Collection, document: Document)
        -> Result<Document, StorageError>;

    /// Store several documents at once
    async fn insert_many(
        &self,
        collection: Collection,
        documents: Vec<Document>,
    ) -> Result<Vec<Document>, StorageError> {
        let mut stored = Vec::with_capacity(documents.len());
        for document in documents {
            stored.push(self.insert(collection, document).await?);
        }
        Ok(stored)
    }

    /// Apply `update` to the first (or every, with `multi`) matching document
    ///
    /// `updatedAt` is always refreshed. Returns the number of documents matched.
    async fn update(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
        multi: bool,
    ) -> Result<u64, StorageError>;

    /// Delete the first (or every, with `multi`) matching document
    async fn remove(
        &self,
        collection: Collection,
        filter: &Filter,
        multi: bool,
    ) -> Result<u64, StorageError>;

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<u64, StorageError>;

    /// Apply every write in order, or none of them
    ///
    /// Returns the number of documents each write touched. On error nothing
    /// the batch did is visible, in memory or on disk.
    async fn write_batch(&self, writes: Vec<BatchWrite>) -> Result<Vec<u64>, StorageError>;

    /// Group matching documents and compute the requested accumulators
    async fn aggregate(
        &self,
        collection: Collection,
        spec: &GroupSpec,
    ) -> Result<Vec<Document>, StorageError>;
}

/// Serialize a domain value into a document
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StorageError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StorageError::Query(format!(
            "Expected a JSON object, got {}",
            other
        ))),
    }
}

/// Deserialize a document into a domain value
pub fn from_document<T: DeserializeOwned>(document: Document) -> Result<T, StorageError> {
    Ok(serde_json::from_value(Value::Object(document))?)
}

/// The `_id` of a stored document
pub fn document_id(document: &Document) -> Option<String> {
    match document.get("_id") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

/// Insert the default categories into an empty categories collection
///
/// Returns how many categories were seeded (zero when any already exist).
pub(crate) async fn seed_default_categories<S>(store: &S) -> Result<usize, StorageError>
where
    S: CollectionStore + ?Sized,
{
    if store.count(Collection::Categories, &Filter::new()).await? > 0 {
        return Ok(0);
    }

    let defaults = crate::domain::DEFAULT_CATEGORIES
        .iter()
        .map(|(name, category_type)| {
            to_document(&crate::domain::Category::new(name, *category_type)?)
        })
        .collect::<Result<Vec<_>, StorageError>>()?;
    let seeded = store.insert_many(Collection::Categories, defaults).await?.len();

    tracing::info!("Seeded {} default categories", seeded);
    Ok(seeded)
}

/// Current time in the canonical stored form
pub(crate) fn now_stamp() -> Value {
    Value::String(crate::domain::format_instant(&chrono::Utc::now()))
}

/// Stamp `createdAt` (unless already present) and `updatedAt` on a new document
pub(crate) fn stamp_new(document: &mut Document) {
    let now = now_stamp();
    let created = match document.get("createdAt") {
        Some(existing) if !existing.is_null() => existing.clone(),
        _ => now.clone(),
    };
    document.insert("createdAt".to_string(), created);
    if document.get("updatedAt").map_or(true, Value::is_null) {
        document.insert("updatedAt".to_string(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_classification() {
        assert!(StorageError::Connection("down".into()).is_retryable());
        assert!(StorageError::NotConnected.is_retryable());
        assert!(!StorageError::Validation(DomainError::InvalidHour(30)).is_retryable());
        assert!(!StorageError::NotFound {
            entity: "Focus session",
            id: "1".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_root_unwraps_retry_wrapper() {
        let error = StorageError::RetriesExhausted {
            attempts: 3,
            source: Box::new(StorageError::Connection("refused".into())),
        };
        assert!(matches!(error.root(), StorageError::Connection(_)));
        assert!(error.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_stamp_new_keeps_created_at() {
        let mut document = to_document(&json!({ "createdAt": "2024-01-01T00:00:00.000Z" })).unwrap();
        stamp_new(&mut document);
        assert_eq!(document["createdAt"], "2024-01-01T00:00:00.000Z");
        assert!(document["updatedAt"].is_string());
    }
}
