// SPDX-License-Identifier: MIT OR Apache-2.0
//! Relational store for Terraplane computation records and plugin
//! metadata.
//!
//! The store owns the canonical computation lifecycle. Its single most
//! important guarantee is the linearizable deduplication decision:
//! concurrent registrations of equivalent requests — equal
//! `(plugin_key, deduplication_key, cache_epoch)` — observe exactly one
//! winner, and every loser receives the winner's correlation uuid.
//!
//! Two implementations share the [`ComputationStore`] trait:
//! [`PgStore`] (PostgreSQL, constraint-enforced) and [`MemoryStore`]
//! (mutex-serialised, for tests and embedded setups).

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// In-memory store implementation.
pub mod memory;
/// PostgreSQL store implementation.
pub mod postgres;
/// Schema DDL, views, and the expected schema revision.
pub mod schema;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tp_core::{
    AoiFeature, ArtifactEnriched, ComputationInfo, ComputationState, PluginInfo, PluginRef,
    ShelfLife,
};
use tp_error::{ErrorCode, PlatformError};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No info row matches the requested plugin (and version).
    #[error("no plugin info available for {plugin_id}")]
    InfoNotFound {
        /// The plugin id that was looked up.
        plugin_id: String,
    },

    /// A newer version of the plugin is already registered.
    #[error(
        "refusing to register plugin {name} in version {version}: a newer version \
         ({existing}) has previously been registered; use the downgrade override \
         to force registration"
    )]
    DowngradeRefused {
        /// Plugin display name.
        name: String,
        /// The incoming version.
        version: Version,
        /// The version already registered.
        existing: Version,
    },

    /// The database schema revision does not match this build.
    #[error("database schema revision {found} does not match the expected revision {expected}")]
    SchemaMismatch {
        /// Revision found in the database.
        found: i64,
        /// Revision this build requires.
        expected: i64,
    },

    /// The referenced computation is not registered.
    #[error("computation {0} is not registered")]
    ComputationNotFound(Uuid),

    /// A stored row could not be decoded into its domain type.
    #[error("stored row could not be decoded: {0}")]
    Corrupt(String),

    /// The underlying database failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<StoreError> for PlatformError {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::InfoNotFound { .. } => ErrorCode::InfoNotReceived,
            StoreError::DowngradeRefused { .. } => ErrorCode::VersionMismatch,
            StoreError::SchemaMismatch { .. } => ErrorCode::SchemaMismatch,
            _ => ErrorCode::Storage,
        };
        PlatformError::new(code, err.to_string()).with_source(err)
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Everything needed to register one computation request.
#[derive(Clone, Debug, PartialEq)]
pub struct ComputationRegistration {
    /// The correlation uuid issued by the requesting client.
    pub correlation_uuid: Uuid,
    /// Raw requested parameters.
    pub requested_params: serde_json::Value,
    /// Target area of interest.
    pub aoi: AoiFeature,
    /// The plugin version the computation is addressed to.
    pub plugin: PluginRef,
    /// Effective shelf life of the result (overrides already applied).
    pub shelf_life: ShelfLife,
    /// When the request was made.
    pub request_ts: DateTime<Utc>,
}

impl ComputationRegistration {
    /// A registration stamped with the current time.
    pub fn new(
        correlation_uuid: Uuid,
        requested_params: serde_json::Value,
        aoi: AoiFeature,
        plugin: PluginRef,
        shelf_life: ShelfLife,
    ) -> Self {
        Self {
            correlation_uuid,
            requested_params,
            aoi,
            plugin,
            shelf_life,
            request_ts: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Task meta
// ---------------------------------------------------------------------------

/// Broker-owned task outcome, mirrored into the store as a side table.
///
/// The relational store owns the semantic lifecycle; this row only
/// mirrors what the dispatch fabric observed (status, traceback, timing)
/// for reporting joins.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    /// Task id; equal to the canonical correlation uuid.
    pub task_id: Uuid,
    /// Task state as observed by the broker.
    pub status: ComputationState,
    /// Result payload, if the task produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// When the terminal state was reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_done: Option<DateTime<Utc>>,
    /// Error chain of a failed task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    /// Task name (`compute`).
    pub name: String,
    /// Positional arguments, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    /// Keyword arguments, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<serde_json::Value>,
    /// Hostname of the worker that ran the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Number of retries performed.
    #[serde(default)]
    pub retries: i32,
    /// Queue the task was routed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

impl TaskMeta {
    /// A fresh `compute` task row in the given state.
    pub fn compute(task_id: Uuid, status: ComputationState) -> Self {
        Self {
            task_id,
            status,
            result: None,
            date_done: None,
            traceback: None,
            name: "compute".into(),
            args: None,
            kwargs: None,
            worker: None,
            retries: 0,
            queue: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Transactional persistence of plugin metadata and computation
/// lifecycle records.
#[async_trait]
pub trait ComputationStore: Send + Sync {
    /// Upsert a plugin info row (and its authors, and the ordered
    /// author links), then flip `latest` flags so exactly one version
    /// per plugin id is latest.
    ///
    /// Refuses when a strictly newer version is already registered,
    /// unless `allow_downgrade` is set. Returns the info key.
    async fn write_info(
        &self,
        info: &PluginInfo,
        allow_downgrade: bool,
    ) -> Result<String, StoreError>;

    /// Read one plugin info: the given version, or the latest one.
    async fn read_info(
        &self,
        plugin_id: &str,
        version: Option<&Version>,
    ) -> Result<PluginInfo, StoreError>;

    /// All `latest` info rows.
    async fn list_infos(&self) -> Result<Vec<PluginInfo>, StoreError>;

    /// Register a computation request and return the canonical
    /// correlation uuid.
    ///
    /// A single-statement upsert on
    /// `(plugin_key, deduplication_key, cache_epoch)` decides between
    /// creating a new computation and aliasing onto an existing one; a
    /// lookup row mapping the user's correlation uuid onto the
    /// canonical one is recorded either way. Rows with no cache epoch
    /// never deduplicate.
    async fn register_computation(
        &self,
        registration: &ComputationRegistration,
    ) -> Result<Uuid, StoreError>;

    /// Attach validated parameters once the worker accepted the input.
    async fn add_validated_params(
        &self,
        correlation_uuid: Uuid,
        params: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Read the full computation record behind a user correlation uuid.
    async fn read_computation(
        &self,
        user_correlation_uuid: Uuid,
    ) -> Result<Option<ComputationInfo>, StoreError>;

    /// Resolve a user correlation uuid onto its canonical computation.
    async fn resolve_computation_id(
        &self,
        user_correlation_uuid: Uuid,
    ) -> Result<Option<Uuid>, StoreError>;

    /// Record a successful computation: artifact rows, outcome message,
    /// artifact errors. With `invalidate_cache` the row's cache epoch is
    /// cleared and `valid_until` backdated so the next equivalent
    /// request re-runs.
    async fn update_successful_computation(
        &self,
        info: &ComputationInfo,
        invalidate_cache: bool,
    ) -> Result<(), StoreError>;

    /// Record a terminal failure. With `cache` the failure is kept
    /// forever (used for input-validation failures so identical bad
    /// input is never re-run); otherwise the row expires immediately.
    async fn update_failed_computation(
        &self,
        correlation_uuid: Uuid,
        message: Option<String>,
        cache: bool,
    ) -> Result<(), StoreError>;

    /// Artifacts of a computation, ordered by rank.
    async fn list_artifacts(
        &self,
        correlation_uuid: Uuid,
    ) -> Result<Vec<ArtifactEnriched>, StoreError>;

    /// Upsert the broker's task outcome mirror.
    async fn record_task_result(&self, meta: &TaskMeta) -> Result<(), StoreError>;

    /// Read the broker's task outcome mirror.
    async fn read_task_result(&self, task_id: Uuid) -> Result<Option<TaskMeta>, StoreError>;
}
