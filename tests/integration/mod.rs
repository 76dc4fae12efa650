/// Integration tests over the local backends
///
/// Every scenario that does not depend on a particular engine runs against
/// both the document store and the SQLite shim.
mod local_backends;
mod migration;

use std::time::Duration;

use focusbook_storage::{BackendChoice, ConnectionOrchestrator, RetryPolicy, StorageConfig};
use tempfile::TempDir;

pub const BACKENDS: [BackendChoice; 2] = [BackendChoice::DocumentStore, BackendChoice::Sqlite];

/// Fast-failing configuration rooted in `dir`
pub fn config(dir: &TempDir, backend: BackendChoice) -> StorageConfig {
    StorageConfig::new(dir.path())
        .with_backend(backend)
        .with_retry(RetryPolicy::new(2, Duration::from_millis(1)))
}

pub async fn connected(dir: &TempDir, backend: BackendChoice) -> ConnectionOrchestrator {
    let orchestrator = ConnectionOrchestrator::new(config(dir, backend));
    orchestrator
        .connect()
        .await
        .expect("Failed to connect orchestrator");
    orchestrator
}
