/// Public library interface for the FocusBook storage layer
///
/// Exports the storage backends, the domain services that run on them, the
/// connection orchestrator that wires the two together and the one-shot
/// migrations between backends.
pub mod config;
pub mod domain;
pub mod migration;
pub mod orchestrator;
pub mod services;
pub mod storage;

// Re-export the types most callers need
pub use config::{BackendChoice, PostgresConfig, RetryPolicy, StorageConfig};
pub use domain::*;
pub use migration::{
    DocumentToSqliteMigration, EntityKind, JsonToPostgresMigration, MigrationError,
    MigrationReport, MigrationStats,
};
pub use orchestrator::{ConnectionOrchestrator, ConnectionState, OrchestratorStats};
pub use services::remote::{RemoteAppUsageService, RemoteCategoriesService, RemoteFocusSessionService};
pub use services::{AppUsageService, CategoriesService, FocusSessionService};
pub use storage::{
    Collection, CollectionStore, DocumentStore, PostgresStore, SqliteStore, StorageAdapter,
    StorageError, StorageKind, StorageStats,
};
