// Artifact Store Client
// Named byte blobs handed from producing job instances to their dependents

pub mod fs;
pub mod memory;

pub use fs::FsArtifactStore;
pub use memory::MemoryArtifactStore;

use crate::error::ArtifactError;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt;

/// Address of an artifact: namespaced by run and producing instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub run_id: Uuid,
    /// Name of the producing instance (`build`, `test[2]`)
    pub producer: String,
    pub name: String,
}

impl ArtifactKey {
    pub fn new(run_id: Uuid, producer: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            run_id,
            producer: producer.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.run_id, self.producer, self.name)
    }
}

/// Metadata kept for every stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub key: ArtifactKey,
    pub size: u64,
    pub retention_days: u32,
    pub created_at: DateTime<Utc>,
}

impl ArtifactRecord {
    pub fn new(key: ArtifactKey, size: u64, retention_days: u32) -> Self {
        Self {
            key,
            size,
            retention_days,
            created_at: Utc::now(),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + ChronoDuration::days(i64::from(self.retention_days))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

/// Blob store shared by every job runner of a run.
///
/// Must be safe under concurrent puts and gets for distinct keys. Retention
/// is a contract on the store: the engine only passes `retention_days`
/// along and never expires anything itself.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(
        &self,
        key: &ArtifactKey,
        data: Vec<u8>,
        retention_days: u32,
    ) -> Result<ArtifactRecord, ArtifactError>;

    /// Fetch an artifact, `ArtifactError::NotFound` when absent or expired
    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, ArtifactError>;

    /// Records stored for a run, sorted by key
    async fn list(&self, run_id: Uuid) -> Result<Vec<ArtifactRecord>, ArtifactError>;
}
