/// Connection orchestration for the local backends
///
/// The orchestrator opens exactly one local backend, builds one instance of
/// each domain service on top of it and hands those out to callers. After
/// `disconnect` every getter fails fast with [`StorageError::NotConnected`]
/// until the next `connect`.
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{BackendChoice, StorageConfig};
use crate::services::{AppUsageService, CategoriesService, FocusSessionService};
use crate::storage::{
    execute_with_retry, CollectionStore, DocumentStore, SqliteStore, StorageError,
    StorageKind, StorageStats,
};

/// Lifecycle of the orchestrator's backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Ready,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Backend statistics together with the orchestrator's view of the connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStats {
    pub state: ConnectionState,
    pub mode: StorageKind,
    pub storage: StorageStats,
}

/// The backend and the services bound to it
struct Active {
    store: Arc<dyn CollectionStore>,
    app_usage: Arc<AppUsageService>,
    categories: Arc<CategoriesService>,
    focus_sessions: Arc<FocusSessionService>,
}

/// Owns the active local backend and its domain services
pub struct ConnectionOrchestrator {
    config: StorageConfig,
    state: RwLock<ConnectionState>,
    active: RwLock<Option<Active>>,
}

impl ConnectionOrchestrator {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ConnectionState::Uninitialized),
            active: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Open the configured backend and build the services on it
    ///
    /// Does nothing when already connected. The focus service's current
    /// session is restored from storage before this returns.
    pub async fn connect(&self) -> Result<(), StorageError> {
        let mut active = self.active.write().await;
        if active.is_some() {
            return Ok(());
        }

        *self.state.write().await = ConnectionState::Connecting;
        info!("Connecting {:?} backend in {}", self.config.backend, self.config.data_dir.display());

        let store: Arc<dyn CollectionStore> = match self.config.backend {
            BackendChoice::DocumentStore => Arc::new(DocumentStore::new(&self.config)),
            BackendChoice::Sqlite => Arc::new(SqliteStore::new(&self.config)),
        };

        if let Err(e) = store.connect().await {
            warn!("Backend connection failed: {}", e);
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(e);
        }

        let retry = self.config.retry;
        let focus_sessions = Arc::new(FocusSessionService::new(store.clone(), retry));
        focus_sessions.load_current_session().await;

        *active = Some(Active {
            app_usage: Arc::new(AppUsageService::new(store.clone(), retry)),
            categories: Arc::new(CategoriesService::new(store.clone(), retry)),
            focus_sessions,
            store,
        });
        *self.state.write().await = ConnectionState::Ready;

        info!("Storage ready ({})", self.storage_kind());
        Ok(())
    }

    /// Close the backend and drop the services
    pub async fn disconnect(&self) -> Result<(), StorageError> {
        let taken = self.active.write().await.take();
        *self.state.write().await = ConnectionState::Disconnected;

        match taken {
            Some(active) => {
                active.store.disconnect().await?;
                info!("Storage disconnected");
            }
            None => info!("Storage was not connected"),
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Which engine `connect` opens
    pub fn storage_kind(&self) -> StorageKind {
        match self.config.backend {
            BackendChoice::DocumentStore => StorageKind::DocumentStore,
            BackendChoice::Sqlite => StorageKind::Sqlite,
        }
    }

    pub async fn store(&self) -> Result<Arc<dyn CollectionStore>, StorageError> {
        self.with_active(|active| active.store.clone()).await
    }

    pub async fn app_usage(&self) -> Result<Arc<AppUsageService>, StorageError> {
        self.with_active(|active| active.app_usage.clone()).await
    }

    pub async fn categories(&self) -> Result<Arc<CategoriesService>, StorageError> {
        self.with_active(|active| active.categories.clone()).await
    }

    pub async fn focus_sessions(&self) -> Result<Arc<FocusSessionService>, StorageError> {
        self.with_active(|active| active.focus_sessions.clone()).await
    }

    async fn with_active<T>(&self, f: impl FnOnce(&Active) -> T) -> Result<T, StorageError> {
        self.active
            .read()
            .await
            .as_ref()
            .map(f)
            .ok_or(StorageError::NotConnected)
    }

    /// Run an operation against the active backend with the configured
    /// retry policy
    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T, StorageError>
    where
        F: FnMut(Arc<dyn CollectionStore>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let store = self.store().await?;
        execute_with_retry(store.as_ref(), &self.config.retry, || operation(store.clone())).await
    }

    /// Whether the active backend answers; `false` when not connected
    pub async fn health_check(&self) -> bool {
        match self.store().await {
            Ok(store) => store.health_check().await,
            Err(_) => false,
        }
    }

    pub async fn get_stats(&self) -> Result<OrchestratorStats, StorageError> {
        let store = self.store().await?;
        Ok(OrchestratorStats {
            state: self.state().await,
            mode: store.kind(),
            storage: store.get_stats().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewSession, SessionType};
    use crate::storage::{Collection, Filter};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_getters_fail_before_connect() {
        let dir = TempDir::new().unwrap();
        let orchestrator = ConnectionOrchestrator::new(StorageConfig::new(dir.path()));

        assert_eq!(orchestrator.state().await, ConnectionState::Uninitialized);
        assert!(matches!(orchestrator.app_usage().await, Err(StorageError::NotConnected)));
        assert!(matches!(orchestrator.get_stats().await, Err(StorageError::NotConnected)));
        assert!(!orchestrator.health_check().await);
    }

    #[tokio::test]
    async fn test_connect_document_store_by_default() {
        let dir = TempDir::new().unwrap();
        let orchestrator = ConnectionOrchestrator::new(StorageConfig::new(dir.path()));
        orchestrator.connect().await.unwrap();
        orchestrator.connect().await.unwrap();

        assert_eq!(orchestrator.state().await, ConnectionState::Ready);
        assert_eq!(orchestrator.storage_kind(), StorageKind::DocumentStore);
        assert!(orchestrator.health_check().await);

        let stats = orchestrator.get_stats().await.unwrap();
        assert_eq!(stats.mode, StorageKind::DocumentStore);
        assert_eq!(stats.storage.collections.get("categories"), Some(&6));

        orchestrator.disconnect().await.unwrap();
        assert_eq!(orchestrator.state().await, ConnectionState::Disconnected);
        assert!(matches!(orchestrator.categories().await, Err(StorageError::NotConnected)));
    }

    #[tokio::test]
    async fn test_execute_with_retry_uses_active_store() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::new(dir.path()).with_backend(BackendChoice::Sqlite);
        let orchestrator = ConnectionOrchestrator::new(config);
        orchestrator.connect().await.unwrap();

        let count = orchestrator
            .execute_with_retry(|store| async move {
                store.count(Collection::Categories, &Filter::new()).await
            })
            .await
            .unwrap();
        assert_eq!(count, 6);
        orchestrator.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_restores_current_session() {
        let dir = TempDir::new().unwrap();
        let orchestrator = ConnectionOrchestrator::new(StorageConfig::new(dir.path()));
        orchestrator.connect().await.unwrap();

        let started = orchestrator
            .focus_sessions()
            .await
            .unwrap()
            .start_session(NewSession::new(SessionType::Focus, 60_000))
            .await
            .unwrap();
        orchestrator.disconnect().await.unwrap();

        orchestrator.connect().await.unwrap();
        let current = orchestrator.focus_sessions().await.unwrap().current_session().await;
        assert_eq!(current.and_then(|s| s.id), started.id);
    }
}
