// SPDX-License-Identifier: MIT OR Apache-2.0
//! S3/MinIO implementation of [`ArtifactStorage`].
//!
//! One configured bucket holds every blob. MinIO needs path-style
//! addressing, so the explicit constructor forces it; the `from_env`
//! constructor picks up ambient AWS configuration instead.

use crate::{
    data_key, metadata_key, resolve_artifact_file, store_id, ArtifactStorage, ObjectStoreError,
    SIBLING_METADATA_KEY, TYPE_DATA, TYPE_METADATA, TYPE_METADATA_KEY,
};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tp_core::ArtifactEnriched;
use tracing::debug;
use uuid::Uuid;

/// S3-compatible blob storage over one bucket.
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// Connect to an S3-compatible endpoint with explicit credentials.
    pub fn new(
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        bucket: impl Into<String>,
    ) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "terraplane");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
            bucket: bucket.into(),
        }
    }

    /// Connect using ambient AWS configuration (environment, profile,
    /// instance metadata).
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self {
            client: Client::new(&config),
            bucket: bucket.into(),
        }
    }

    /// Ensure the configured bucket exists, creating it when absent.
    pub async fn ensure_bucket(&self) -> Result<(), ObjectStoreError> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn put_bytes(
        &self,
        key: &str,
        bytes: Vec<u8>,
        blob_type: &str,
        sibling: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .metadata(TYPE_METADATA_KEY, blob_type)
            .metadata(SIBLING_METADATA_KEY, sibling)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|_| ObjectStoreError::BlobNotFound {
                key: key.to_string(),
            })?;
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn blob_type(&self, key: &str) -> Result<Option<String>, ObjectStoreError> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        Ok(head
            .metadata()
            .and_then(|m| m.get(TYPE_METADATA_KEY))
            .cloned())
    }
}

#[async_trait]
impl ArtifactStorage for S3Storage {
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

        let bytes = tokio::fs::read(&file).await?;
        let descriptor = serde_json::to_vec(artifact)
            .map_err(|e| ObjectStoreError::BadDescriptor(e.to_string()))?;

        self.put_bytes(&data, bytes, TYPE_DATA, &meta).await?;
        self.put_bytes(&meta, descriptor, TYPE_METADATA, &data)
            .await?;
        debug!(key = %data, "artifact uploaded");
        Ok(id)
    }

    async fn list_all(
        &self,
        correlation_uuid: Uuid,
    ) -> Result<Vec<ArtifactEnriched>, ObjectStoreError> {
        let prefix = format!("{correlation_uuid}/");
        let mut out = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let page = request
                .send()
                .await
                .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                if self.blob_type(key).await?.as_deref() != Some(TYPE_DATA) {
                    continue;
                }
                let sibling = format!("{key}{}", crate::METADATA_SUFFIX);
                let descriptor: ArtifactEnriched =
                    serde_json::from_slice(&self.get_bytes(&sibling).await?)
                        .map_err(|e| ObjectStoreError::BadDescriptor(e.to_string()))?;
                out.push(descriptor);
            }

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(out)
    }

    async fn fetch(
        &self,
        correlation_uuid: Uuid,
        store_id: &str,
        target: &Path,
    ) -> Result<PathBuf, ObjectStoreError> {
        let bytes = self.get_bytes(&data_key(correlation_uuid, store_id)).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, bytes).await?;
        Ok(target.to_path_buf())
    }

    async fn artifact_url(
        &self,
        correlation_uuid: Uuid,
        store_id: &str,
        ttl: Duration,
    ) -> Result<String, ObjectStoreError> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(data_key(correlation_uuid, store_id))
            .presigned(presigning)
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;
        Ok(presigned.uri().to_string())
    }
}
