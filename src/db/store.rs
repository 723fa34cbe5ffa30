use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Mutex,
};

use anyhow::Context;
use async_trait::async_trait;

use super::models::{Watermark, WatermarkKey};

/// Persistence for the resumable ingestion position.
///
/// `save` must be idempotent: writing the same watermark twice leaves the
/// store unchanged.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self, key: &WatermarkKey) -> anyhow::Result<Option<Watermark>>;

    async fn save(&self, watermark: &Watermark) -> anyhow::Result<()>;
}

/// Process-local store for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryWatermarkStore {
    data: Mutex<HashMap<WatermarkKey, Watermark>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn load(&self, key: &WatermarkKey) -> anyhow::Result<Option<Watermark>> {
        let data = self
            .data
            .lock()
            .map_err(|_| anyhow::anyhow!("watermark store lock poisoned"))?;
        Ok(data.get(key).cloned())
    }

    async fn save(&self, watermark: &Watermark) -> anyhow::Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| anyhow::anyhow!("watermark store lock poisoned"))?;
        data.insert(watermark.key(), watermark.clone());
        Ok(())
    }
}

/// JSON file holding one watermark per `chain:contract` key.
///
/// Writes go to a sibling temp file that is then renamed over the target, so
/// a crash mid-write leaves the previous contents intact.
pub struct FileWatermarkStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> anyhow::Result<BTreeMap<String, Watermark>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Corrupt watermark file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read watermark file {}", self.path.display())),
        }
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn load(&self, key: &WatermarkKey) -> anyhow::Result<Option<Watermark>> {
        Ok(self.read_all().await?.remove(&key.to_string()))
    }

    async fn save(&self, watermark: &Watermark) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut all = self.read_all().await?;
        all.insert(watermark.key().to_string(), watermark.clone());
        let json = serde_json::to_vec_pretty(&all)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("domwatch-{}-{}.json", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryWatermarkStore::new();
        let key = WatermarkKey::new(1, "0xABCD");

        assert!(store.load(&key).await.unwrap().is_none());
        store.save(&Watermark::new(&key, 42)).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap().unwrap().last_confirmed_block, 42);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let path = temp_path("persist");
        let _ = tokio::fs::remove_file(&path).await;
        let key = WatermarkKey::new(97476, "0x96db117d850F1ca2990374Da4E027B9aE6716D81");

        let store = FileWatermarkStore::new(&path);
        assert!(store.load(&key).await.unwrap().is_none());
        store.save(&Watermark::new(&key, 1_000)).await.unwrap();
        store.save(&Watermark::new(&key, 1_500)).await.unwrap();

        let reopened = FileWatermarkStore::new(&path);
        let loaded = reopened.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.last_confirmed_block, 1_500);
        assert_eq!(loaded.contract_address, "0x96db117d850f1ca2990374da4e027b9ae6716d81");

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_file_store_keeps_other_keys() {
        let path = temp_path("keys");
        let _ = tokio::fs::remove_file(&path).await;
        let store = FileWatermarkStore::new(&path);
        let a = WatermarkKey::new(1, "0xaaaa");
        let b = WatermarkKey::new(2, "0xaaaa");

        store.save(&Watermark::new(&a, 10)).await.unwrap();
        store.save(&Watermark::new(&b, 20)).await.unwrap();

        assert_eq!(store.load(&a).await.unwrap().unwrap().last_confirmed_block, 10);
        assert_eq!(store.load(&b).await.unwrap().unwrap().last_confirmed_block, 20);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let path = temp_path("corrupt");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = FileWatermarkStore::new(&path);
        assert!(store.load(&WatermarkKey::new(1, "0xaaaa")).await.is_err());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
