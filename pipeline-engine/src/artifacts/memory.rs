// In-Memory Artifact Store
// Keeps artifacts for the lifetime of the process

use crate::artifacts::{ArtifactKey, ArtifactRecord, ArtifactStore};
use crate::error::ArtifactError;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Artifact store backed by a shared map
#[derive(Debug, Clone, Default)]
pub struct MemoryArtifactStore {
    entries: Arc<RwLock<HashMap<ArtifactKey, (ArtifactRecord, Vec<u8>)>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        key: &ArtifactKey,
        data: Vec<u8>,
        retention_days: u32,
    ) -> Result<ArtifactRecord, ArtifactError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Err(ArtifactError::Rejected {
                key: key.to_string(),
                message: "artifact already exists".to_string(),
            });
        }

        let record = ArtifactRecord::new(key.clone(), data.len() as u64, retention_days);
        entries.insert(key.clone(), (record.clone(), data));
        Ok(record)
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, ArtifactError> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some((record, data)) if !record.is_expired(Utc::now()) => Ok(data.clone()),
            _ => Err(ArtifactError::NotFound(key.to_string())),
        }
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<ArtifactRecord>, ArtifactError> {
        let entries = self.entries.read().await;
        let mut records: Vec<ArtifactRecord> = entries
            .values()
            .filter(|(record, _)| record.key.run_id == run_id)
            .map(|(record, _)| record.clone())
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryArtifactStore::new();
        let key = ArtifactKey::new(Uuid::new_v4(), "build", "dist");

        let record = store.put(&key, b"wheel".to_vec(), 7).await.unwrap();
        assert_eq!(record.size, 5);
        assert_eq!(store.get(&key).await.unwrap(), b"wheel");
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = MemoryArtifactStore::new();
        let key = ArtifactKey::new(Uuid::new_v4(), "build", "dist");
        assert!(matches!(
            store.get(&key).await,
            Err(ArtifactError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_put_is_rejected() {
        let store = MemoryArtifactStore::new();
        let key = ArtifactKey::new(Uuid::new_v4(), "build", "dist");

        store.put(&key, vec![1], 7).await.unwrap();
        assert!(matches!(
            store.put(&key, vec![2], 7).await,
            Err(ArtifactError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_keys_are_namespaced_by_producer() {
        let store = MemoryArtifactStore::new();
        let run_id = Uuid::new_v4();

        store
            .put(&ArtifactKey::new(run_id, "test[0]", "coverage"), vec![0], 1)
            .await
            .unwrap();
        store
            .put(&ArtifactKey::new(run_id, "test[1]", "coverage"), vec![1], 1)
            .await
            .unwrap();
        store
            .put(&ArtifactKey::new(Uuid::new_v4(), "test[0]", "coverage"), vec![9], 1)
            .await
            .unwrap();

        let records = store.list(run_id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key.producer, "test[0]");
        assert_eq!(store.len().await, 3);
    }
}
