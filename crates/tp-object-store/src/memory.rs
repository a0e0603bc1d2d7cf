// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory implementation of [`ArtifactStorage`] for tests and
//! embedded setups.

use crate::{
    data_key, metadata_key, resolve_artifact_file, store_id, ArtifactStorage, ObjectStoreError,
    SIBLING_METADATA_KEY, TYPE_DATA, TYPE_METADATA, TYPE_METADATA_KEY,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tp_core::ArtifactEnriched;
use uuid::Uuid;

#[derive(Clone)]
struct Blob {
    bytes: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

/// Blob storage backed by a process-local map.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: Mutex<BTreeMap<String, Blob>>,
}

impl MemoryStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of a blob, if present. Test helper.
    pub fn blob_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).map(|b| b.bytes.clone())
    }

    /// Number of stored blobs (data and metadata). Test helper.
    pub fn blob_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Blob>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ArtifactStorage for MemoryStorage {
    async fn save(
        &self,
        artifact: &ArtifactEnriched,
        file_dir: &Path,
    ) -> Result<String, ObjectStoreError> {
        let file = resolve_artifact_file(file_dir, &artifact.filename)?;
        let effective_name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&artifact.filename);
        let id = store_id(artifact.correlation_uuid, effective_name);
        let data = data_key(artifact.correlation_uuid, &id);
        let meta = metadata_key(artifact.correlation_uuid, &id);

        let bytes = std::fs::read(&file)?;
        let descriptor = serde_json::to_vec(artifact)
            .map_err(|e| ObjectStoreError::BadDescriptor(e.to_string()))?;

        let mut blobs = self.lock();
        blobs.insert(
            data.clone(),
            Blob {
                bytes,
                metadata: BTreeMap::from([
                    (TYPE_METADATA_KEY.to_string(), TYPE_DATA.to_string()),
                    (SIBLING_METADATA_KEY.to_string(), meta.clone()),
                ]),
            },
        );
        blobs.insert(
            meta,
            Blob {
                bytes: descriptor,
                metadata: BTreeMap::from([
                    (TYPE_METADATA_KEY.to_string(), TYPE_METADATA.to_string()),
                    (SIBLING_METADATA_KEY.to_string(), data),
                ]),
            },
        );
        Ok(id)
    }

    async fn list_all(
        &self,
        correlation_uuid: Uuid,
    ) -> Result<Vec<ArtifactEnriched>, ObjectStoreError> {
        let prefix = format!("{correlation_uuid}/");
        let blobs = self.lock();

        let mut out = Vec::new();
        for (key, blob) in blobs.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            if blob.metadata.get(TYPE_METADATA_KEY).map(String::as_str) != Some(TYPE_DATA) {
                continue;
            }
            let sibling = blob
                .metadata
                .get(SIBLING_METADATA_KEY)
                .and_then(|k| blobs.get(k))
                .ok_or_else(|| ObjectStoreError::BlobNotFound {
                    key: format!("{key}{}", crate::METADATA_SUFFIX),
                })?;
            let descriptor: ArtifactEnriched = serde_json::from_slice(&sibling.bytes)
                .map_err(|e| ObjectStoreError::BadDescriptor(e.to_string()))?;
            out.push(descriptor);
        }
        Ok(out)
    }

    async fn fetch(
        &self,
        correlation_uuid: Uuid,
        store_id: &str,
        target: &Path,
    ) -> Result<PathBuf, ObjectStoreError> {
        let key = data_key(correlation_uuid, store_id);
        let bytes = self
            .lock()
            .get(&key)
            .map(|b| b.bytes.clone())
            .ok_or(ObjectStoreError::BlobNotFound { key })?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, bytes)?;
        Ok(target.to_path_buf())
    }

    async fn artifact_url(
        &self,
        correlation_uuid: Uuid,
        store_id: &str,
        ttl: Duration,
    ) -> Result<String, ObjectStoreError> {
        let key = data_key(correlation_uuid, store_id);
        if !self.lock().contains_key(&key) {
            return Err(ObjectStoreError::BlobNotFound { key });
        }
        Ok(format!("memory://{key}?expires_in={}", ttl.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tp_core::{ArtifactModality, Attachments};

    fn artifact(correlation_uuid: Uuid, filename: &str) -> ArtifactEnriched {
        ArtifactEnriched {
            correlation_uuid,
            rank: 0,
            name: "Report".into(),
            modality: ArtifactModality::Markdown,
            primary: true,
            tags: BTreeSet::new(),
            summary: "A report.".into(),
            description: None,
            filename: filename.into(),
            attachments: Attachments::default(),
            sources: vec![],
        }
    }

    #[tokio::test]
    async fn save_writes_data_and_metadata_sibling() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.md"), b"# hi").unwrap();
        let storage = MemoryStorage::new();
        let uuid = Uuid::new_v4();

        let id = storage.save(&artifact(uuid, "report"), dir.path()).await.unwrap();
        assert!(id.ends_with("report.md"), "effective name keeps the extension");
        assert_eq!(storage.blob_count(), 2);
        assert_eq!(
            storage.blob_bytes(&data_key(uuid, &id)).unwrap(),
            b"# hi".to_vec()
        );
    }

    #[tokio::test]
    async fn list_all_reconstructs_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), b"a").unwrap();
        std::fs::write(dir.path().join("b.md"), b"b").unwrap();
        let storage = MemoryStorage::new();
        let uuid = Uuid::new_v4();

        storage.save(&artifact(uuid, "a"), dir.path()).await.unwrap();
        storage.save(&artifact(uuid, "b"), dir.path()).await.unwrap();

        let listed = storage.list_all(uuid).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|a| a.correlation_uuid == uuid));

        // Another computation's blobs are invisible under this prefix.
        assert!(storage.list_all(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_roundtrips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), b"\x00\x01").unwrap();
        let storage = MemoryStorage::new();
        let uuid = Uuid::new_v4();
        let id = storage
            .save(&artifact(uuid, "data"), dir.path())
            .await
            .unwrap();

        let target = dir.path().join("out/data.bin");
        let path = storage.fetch(uuid, &id, &target).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"\x00\x01");
    }

    #[tokio::test]
    async fn url_requires_existing_blob() {
        let storage = MemoryStorage::new();
        let err = storage
            .artifact_url(Uuid::new_v4(), "ghost", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::BlobNotFound { .. }));
    }
}
