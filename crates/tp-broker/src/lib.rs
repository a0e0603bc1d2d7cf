// SPDX-License-Identifier: MIT OR Apache-2.0
//! Task dispatch fabric and lifecycle event fan-out for Terraplane.
//!
//! The broker routes compute tasks to a plugin-specific queue, persists
//! task results into the store's side table, and publishes every
//! lifecycle transition on a fan-out exchange. Workers pull one task at
//! a time from their queue to respect memory budgets.
//!
//! The [`Broker`] trait is the seam; [`InProcessBroker`] is the
//! tokio-channel implementation used by embedded deployments and the
//! test suite.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Fan-out event bus with filtered subscriptions.
pub mod bus;
/// In-process broker implementation.
pub mod inprocess;

pub use bus::{EventBus, EventSubscription};
pub use inprocess::InProcessBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tp_core::{ComputationState, ComputeCommand, PluginInfo};
use tp_error::{ErrorCode, PlatformError};
use tp_store::{StoreError, TaskMeta};
use uuid::Uuid;

/// Capability tag advertised by workers that accept compute tasks.
pub const COMPUTE_CAPABILITY: &str = "compute";

/// Capability tag for the implicit info reply.
pub const INFO_CAPABILITY: &str = "info";

/// Bounded capacity of each per-plugin compute queue.
pub const QUEUE_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No worker serves the given routing key.
    #[error("no worker queue is bound for routing key {plugin_key:?}")]
    UnknownRoute {
        /// The routing key that was addressed.
        plugin_key: String,
    },

    /// The per-plugin queue has reached its capacity.
    #[error("compute queue for {plugin_key:?} is full")]
    QueueFull {
        /// The routing key that was addressed.
        plugin_key: String,
    },

    /// No info reply arrived within the request TTL.
    #[error(
        "the info request for plugin {plugin_id:?} did not respond within \
         the time limit of {ttl_secs} seconds"
    )]
    InfoNotReceived {
        /// The plugin id that was asked.
        plugin_id: String,
        /// The TTL that expired.
        ttl_secs: u64,
    },

    /// Recording the task result failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BrokerError> for PlatformError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::InfoNotReceived { .. } | BrokerError::UnknownRoute { .. } => {
                PlatformError::new(ErrorCode::InfoNotReceived, err.to_string()).with_source(err)
            }
            BrokerError::Store(store) => store.into(),
            other => PlatformError::internal(other.to_string()).with_source(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker registry types
// ---------------------------------------------------------------------------

/// Everything a worker announces when binding its queue.
#[derive(Clone, Debug)]
pub struct WorkerRegistration {
    /// Routing key of the queue (`"{plugin_id};{version}"`).
    pub plugin_key: String,
    /// Worker hostname (`"{plugin_id}@{host}"`).
    pub hostname: String,
    /// Advertised task capabilities.
    pub capabilities: BTreeSet<String>,
    /// The enriched plugin info served on info requests.
    pub info: PluginInfo,
}

/// Registry view of one bound worker.
#[derive(Clone, Debug)]
pub struct WorkerInfo {
    /// Routing key of the worker's queue.
    pub plugin_key: String,
    /// Worker hostname (`"{plugin_id}@{host}"`).
    pub hostname: String,
    /// Advertised task capabilities.
    pub capabilities: BTreeSet<String>,
    /// Version of the plugin the worker serves.
    pub version: semver::Version,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Dispatch knobs carried alongside a compute command.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchOptions {
    /// Soft time limit for the task execution.
    pub time_limit: Option<Duration>,
    /// How long the task may wait in the queue before it is discarded.
    pub queue_ttl: Option<Duration>,
}

/// One compute task as delivered to a worker queue.
#[derive(Debug)]
pub struct ComputeTask {
    /// The task id; equal to the canonical correlation uuid.
    pub task_id: Uuid,
    /// The compute command payload.
    pub command: ComputeCommand,
    /// Soft execution time limit.
    pub time_limit: Option<Duration>,
    /// Instant after which the queued task is discarded as expired.
    pub expires_at: Option<DateTime<Utc>>,
    /// Revocation signal; flips to `true` when the task is revoked.
    pub revoked: watch::Receiver<bool>,
}

impl ComputeTask {
    /// Whether the task outlived its queue TTL.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }

    /// Whether the task has been revoked.
    pub fn is_revoked(&self) -> bool {
        *self.revoked.borrow()
    }
}

/// Receiving end of a per-plugin compute queue.
///
/// Workers pull exactly one task at a time (prefetch 1): the next call
/// happens only after the previous task finished.
pub struct WorkerQueue {
    receiver: mpsc::Receiver<ComputeTask>,
}

impl WorkerQueue {
    pub(crate) fn new(receiver: mpsc::Receiver<ComputeTask>) -> Self {
        Self { receiver }
    }

    /// Wait for the next task. Returns `None` once the queue is unbound.
    pub async fn next_task(&mut self) -> Option<ComputeTask> {
        self.receiver.recv().await
    }
}

// ---------------------------------------------------------------------------
// Broker trait
// ---------------------------------------------------------------------------

/// Reliable task dispatch: queue routing, task-result persistence, and
/// lifecycle event publishing.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Bind a worker queue for a plugin, replacing any previous binding
    /// of the same routing key. Returns the queue to drain.
    async fn register_worker(
        &self,
        registration: WorkerRegistration,
    ) -> Result<WorkerQueue, BrokerError>;

    /// Workers currently bound to live queues.
    async fn active_workers(&self) -> Vec<WorkerInfo>;

    /// Ask a plugin for its info. Fails with
    /// [`BrokerError::InfoNotReceived`] when no worker for `plugin_id`
    /// replies within `ttl`.
    async fn request_info(&self, plugin_id: &str, ttl: Duration)
        -> Result<PluginInfo, BrokerError>;

    /// Route a compute task to the plugin's queue with
    /// `task_id = command.correlation_uuid`.
    async fn send_compute(
        &self,
        plugin_key: &str,
        command: ComputeCommand,
        options: DispatchOptions,
    ) -> Result<(), BrokerError>;

    /// Signal revocation of a queued or in-flight task. Returns whether
    /// a matching task was found.
    async fn revoke(&self, task_id: Uuid) -> Result<bool, BrokerError>;

    /// Persist a task transition into the store's side table and
    /// publish the matching lifecycle event.
    async fn record_task_transition(
        &self,
        meta: &TaskMeta,
        message: Option<String>,
    ) -> Result<(), BrokerError>;

    /// Publish a bare lifecycle event without touching the task table.
    fn publish_status(
        &self,
        correlation_uuid: Uuid,
        status: ComputationState,
        message: Option<String>,
    );

    /// Subscribe to future lifecycle events, optionally filtered to one
    /// correlation uuid. No backlog is replayed.
    fn subscribe(&self, filter: Option<Uuid>) -> EventSubscription;
}
