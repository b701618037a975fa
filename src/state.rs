//! Application state shared across handlers

use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::crypto::AtRestCipher;
use crate::db::Database;
use crate::files::FileStore;
use crate::ws::{Hub, HubHandle};

/// Shared state: the store, the hub handle, the upload store, and the
/// configuration. The hub is an explicit dependency of every handler that
/// emits events; there is no process-global instance.
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub hub: HubHandle,
    pub files: FileStore,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let cipher = config.encryption_key.as_ref().map(AtRestCipher::new);
        let db = Database::new(&config.db_path, cipher).await?;

        let files = FileStore::new(config.upload_dir.clone());
        files.init().await?;

        let hub = Hub::spawn();

        Ok(Self {
            config,
            db,
            hub,
            files,
        })
    }

    /// In-memory database and a throwaway upload directory, for tests.
    pub async fn new_in_memory() -> Result<Self> {
        let config = Config {
            db_path: ":memory:".to_string(),
            upload_dir: std::env::temp_dir().join(format!("shitcord-test-{}", uuid::Uuid::new_v4())),
            ..Config::default()
        };
        Self::new(config).await
    }
}

/// Shared application state type
pub type SharedState = Arc<AppState>;
