use std::sync::Arc;

use log::info;

use crate::config::{StorageBackend, StorageSettings};

pub mod models;
pub mod postgres;
mod store;

pub use postgres::PostgresClient;
pub use store::{FileWatermarkStore, MemoryWatermarkStore, WatermarkStore};

/// Open the watermark store selected by `storage.backend`, running
/// migrations where the backend needs them.
pub async fn open_watermark_store(
    settings: &StorageSettings,
) -> anyhow::Result<Arc<dyn WatermarkStore>> {
    let store: Arc<dyn WatermarkStore> = match settings.backend {
        StorageBackend::File => {
            info!("[STORE] Watermark file: {}", settings.path);
            Arc::new(FileWatermarkStore::new(&settings.path))
        },
        StorageBackend::Postgres => {
            let pg = settings
                .postgres
                .clone()
                .ok_or_else(|| anyhow::anyhow!("storage.postgres section is missing"))?;
            let client = PostgresClient::new(pg).await?;
            client.migrate().await?;
            Arc::new(client)
        },
        StorageBackend::Memory => {
            info!("[STORE] Watermark kept in memory only; restarts begin at start_block");
            Arc::new(MemoryWatermarkStore::new())
        },
    };

    Ok(store)
}
