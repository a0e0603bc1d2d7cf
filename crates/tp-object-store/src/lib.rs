// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact blob storage for the Terraplane platform.
//!
//! Saving an artifact performs two blob puts: the data blob at
//! `{correlation_uuid}/{store_id}` and a sibling metadata-JSON blob at
//! `{correlation_uuid}/{store_id}.metadata.json` holding the artifact
//! descriptor. Each blob carries user metadata naming its type and its
//! sibling, so a prefix listing can be reduced to data blobs and their
//! descriptors without guessing.
//!
//! The object store owns blob content but no semantic state: which
//! artifacts a computation produced is recorded in the relational
//! store; blobs for a crashed upload are simply unreachable.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// In-memory implementation for tests and embedded setups.
pub mod memory;
/// S3/MinIO implementation.
pub mod s3;

pub use memory::MemoryStorage;
pub use s3::S3Storage;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tp_core::{sanitize_filename, ArtifactEnriched};
use uuid::Uuid;

/// Suffix of the metadata sibling blob of every data blob.
pub const METADATA_SUFFIX: &str = ".metadata.json";

/// User-metadata key naming the blob kind.
pub const TYPE_METADATA_KEY: &str = "type";

/// Blob kind value for data blobs.
pub const TYPE_DATA: &str = "data";

/// Blob kind value for metadata blobs.
pub const TYPE_METADATA: &str = "metadata";

/// User-metadata key cross-referencing the sibling blob.
pub const SIBLING_METADATA_KEY: &str = "sibling-object-name";

/// Default time-to-live of presigned artifact URLs (one day).
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(86_400);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by artifact storage operations.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    /// The artifact file was not found in the computation directory.
    #[error("no file for artifact {filename:?} in {dir}")]
    FileNotFound {
        /// Descriptor filename that was looked for.
        filename: String,
        /// Directory that was searched.
        dir: String,
    },

    /// The requested blob does not exist.
    #[error("object {key} does not exist")]
    BlobNotFound {
        /// Blob key.
        key: String,
    },

    /// A stored descriptor could not be decoded.
    #[error("stored artifact descriptor could not be decoded: {0}")]
    BadDescriptor(String),

    /// Local file IO failed.
    #[error("object store file IO failed")]
    Io(#[from] std::io::Error),

    /// The underlying object store failed.
    #[error("object store backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Derive the store id of an artifact file: the ASCII-sanitised
/// effective file name, prefixed with the owning correlation uuid to
/// prevent collisions across computations.
pub fn store_id(correlation_uuid: Uuid, effective_filename: &str) -> String {
    format!(
        "{correlation_uuid}-{}",
        sanitize_filename(effective_filename)
    )
}

/// The data blob key of a store id.
pub fn data_key(correlation_uuid: Uuid, store_id: &str) -> String {
    format!("{correlation_uuid}/{store_id}")
}

/// The metadata blob key of a store id.
pub fn metadata_key(correlation_uuid: Uuid, store_id: &str) -> String {
    format!("{correlation_uuid}/{store_id}{METADATA_SUFFIX}")
}

/// Locate the file backing an artifact descriptor inside the
/// computation directory.
///
/// Descriptor filenames are extensionless; the effective stored name is
/// the matching directory entry, extension included. An exact match
/// wins over a stem match.
pub fn resolve_artifact_file(
    file_dir: &Path,
    filename: &str,
) -> Result<PathBuf, ObjectStoreError> {
    let exact = file_dir.join(filename);
    if exact.is_file() {
        return Ok(exact);
    }
    let entries = std::fs::read_dir(file_dir)?;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str());
        if stem == Some(filename) {
            return Ok(path);
        }
    }
    Err(ObjectStoreError::FileNotFound {
        filename: filename.to_string(),
        dir: file_dir.display().to_string(),
    })
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Content-addressable artifact blob storage.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Save one artifact: upload the data blob and its metadata sibling.
    /// Returns the store id.
    async fn save(
        &self,
        artifact: &ArtifactEnriched,
        file_dir: &Path,
    ) -> Result<String, ObjectStoreError>;

    /// Save several artifacts in order, returning their store ids.
    async fn save_all(
        &self,
        artifacts: &[ArtifactEnriched],
        file_dir: &Path,
    ) -> Result<Vec<String>, ObjectStoreError> {
        let mut ids = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            ids.push(self.save(artifact, file_dir).await?);
        }
        Ok(ids)
    }

    /// Reconstruct the descriptors of every data blob stored under a
    /// computation, in no particular order.
    async fn list_all(
        &self,
        correlation_uuid: Uuid,
    ) -> Result<Vec<ArtifactEnriched>, ObjectStoreError>;

    /// Download a data blob to a local path and return that path.
    async fn fetch(
        &self,
        correlation_uuid: Uuid,
        store_id: &str,
        target: &Path,
    ) -> Result<PathBuf, ObjectStoreError>;

    /// A presigned GET URL for a data blob, valid for `ttl`.
    async fn artifact_url(
        &self,
        correlation_uuid: Uuid,
        store_id: &str,
        ttl: Duration,
    ) -> Result<String, ObjectStoreError>;
}
