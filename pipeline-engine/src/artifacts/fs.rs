// Filesystem Artifact Store
// Stores artifacts under <root>/<run id>/<producer>/ with a JSON metadata sidecar

use crate::artifacts::{ArtifactKey, ArtifactRecord, ArtifactStore};
use crate::error::ArtifactError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const DATA_EXT: &str = "bin";
const META_EXT: &str = "json";

/// Artifact store backed by a local directory
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default location: ~/.flowrun/artifacts
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".flowrun")
            .join("artifacts")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(key.run_id.to_string())
            .join(sanitize(&key.producer))
    }

    fn data_path(&self, key: &ArtifactKey) -> PathBuf {
        self.entry_dir(key)
            .join(format!("{}.{}", sanitize(&key.name), DATA_EXT))
    }

    fn meta_path(&self, key: &ArtifactKey) -> PathBuf {
        self.entry_dir(key)
            .join(format!("{}.{}", sanitize(&key.name), META_EXT))
    }

    async fn read_record(path: &Path) -> Result<ArtifactRecord, ArtifactError> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Sidecar metadata files below `dir`, one level per producer
    async fn meta_files(dir: &Path) -> Result<Vec<PathBuf>, ArtifactError> {
        let mut files = Vec::new();

        let mut producers = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(producer) = producers.next_entry().await? {
            if !producer.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(producer.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some(META_EXT) {
                    files.push(path);
                }
            }
        }

        Ok(files)
    }

    /// Delete every artifact whose retention ran out before `now`.
    /// Returns the number of artifacts removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, ArtifactError> {
        let mut removed = 0;

        let mut runs = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(run) = runs.next_entry().await? {
            if !run.file_type().await?.is_dir() {
                continue;
            }

            for meta in Self::meta_files(&run.path()).await? {
                let record = match Self::read_record(&meta).await {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(path = %meta.display(), error = %e, "skipping unreadable artifact metadata");
                        continue;
                    }
                };

                if record.is_expired(now) {
                    remove_if_present(&self.data_path(&record.key)).await?;
                    remove_if_present(&meta).await?;
                    removed += 1;
                    tracing::debug!(artifact = %record.key, "purged expired artifact");
                }
            }
        }

        Ok(removed)
    }
}

impl Default for FsArtifactStore {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        key: &ArtifactKey,
        data: Vec<u8>,
        retention_days: u32,
    ) -> Result<ArtifactRecord, ArtifactError> {
        let meta_path = self.meta_path(key);
        if tokio::fs::try_exists(&meta_path).await? {
            return Err(ArtifactError::Rejected {
                key: key.to_string(),
                message: "artifact already exists".to_string(),
            });
        }

        tokio::fs::create_dir_all(self.entry_dir(key)).await?;

        let record = ArtifactRecord::new(key.clone(), data.len() as u64, retention_days);
        tokio::fs::write(self.data_path(key), &data).await?;
        // Metadata last: a sidecar means the blob is complete
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&record)?).await?;

        Ok(record)
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Vec<u8>, ArtifactError> {
        let record = match Self::read_record(&self.meta_path(key)).await {
            Ok(record) => record,
            Err(ArtifactError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e),
        };

        if record.is_expired(Utc::now()) {
            return Err(ArtifactError::NotFound(key.to_string()));
        }

        match tokio::fs::read(self.data_path(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, run_id: Uuid) -> Result<Vec<ArtifactRecord>, ArtifactError> {
        let mut records = Vec::new();
        for meta in Self::meta_files(&self.root.join(run_id.to_string())).await? {
            records.push(Self::read_record(&meta).await?);
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }
}

async fn remove_if_present(path: &Path) -> Result<(), ArtifactError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Keep file names portable: `test[0]` becomes `test_0_`
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
