//! Application state shared across handlers.

use crate::catalog::{MetadataCatalog, VideoCatalog};
use crate::coordinator::SessionCoordinator;
use reel_core::config::AppConfig;
use reel_metadata::MetadataStore;
use reel_storage::ObjectStore;
use std::sync::Arc;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Object storage backend.
    pub storage: Arc<dyn ObjectStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Session lifecycle and maintenance operations.
    pub coordinator: Arc<SessionCoordinator>,
}

impl AppState {
    /// Create application state with the metadata-backed video catalog.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let catalog = Arc::new(MetadataCatalog::new(metadata.clone()));
        Self::with_catalog(config, storage, metadata, catalog)
    }

    /// Create application state around a specific video catalog.
    pub fn with_catalog(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        catalog: Arc<dyn VideoCatalog>,
    ) -> Self {
        let config = Arc::new(config);
        let coordinator = Arc::new(SessionCoordinator::new(
            config.clone(),
            storage.clone(),
            metadata.clone(),
            catalog,
        ));
        Self {
            config,
            storage,
            metadata,
            coordinator,
        }
    }
}
