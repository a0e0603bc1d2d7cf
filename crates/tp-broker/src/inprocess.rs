// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process broker built on tokio channels.
//!
//! Queues are bounded mpsc channels keyed by routing key; the event
//! exchange is a broadcast channel. Task results are mirrored into the
//! store's side table on every recorded transition.

use crate::{
    Broker, BrokerError, ComputeTask, DispatchOptions, EventBus, EventSubscription, WorkerInfo,
    WorkerQueue, WorkerRegistration, QUEUE_CAPACITY,
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tp_core::{ComputationState, ComputeCommand, ComputeCommandResult, PluginInfo};
use tp_store::{ComputationStore, TaskMeta};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct BoundWorker {
    registration: WorkerRegistration,
    sender: mpsc::Sender<ComputeTask>,
}

struct Inner {
    workers: Mutex<HashMap<String, BoundWorker>>,
    revocations: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
    bus: EventBus,
    store: Arc<dyn ComputationStore>,
}

/// Tokio-channel broker for embedded deployments and tests.
#[derive(Clone)]
pub struct InProcessBroker {
    inner: Arc<Inner>,
}

impl InProcessBroker {
    /// Create a broker mirroring task results into `store`.
    pub fn new(store: Arc<dyn ComputationStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                workers: Mutex::new(HashMap::new()),
                revocations: Mutex::new(HashMap::new()),
                bus: EventBus::new(),
                store,
            }),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, BoundWorker>> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn revocations(&self) -> MutexGuard<'_, HashMap<Uuid, watch::Sender<bool>>> {
        self.inner
            .revocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    async fn register_worker(
        &self,
        registration: WorkerRegistration,
    ) -> Result<WorkerQueue, BrokerError> {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let plugin_key = registration.plugin_key.clone();
        let replaced = self.workers().insert(
            plugin_key.clone(),
            BoundWorker {
                registration,
                sender,
            },
        );
        if replaced.is_some() {
            warn!(plugin = %plugin_key, "worker queue re-bound; previous binding closed");
        } else {
            info!(plugin = %plugin_key, "worker queue bound");
        }
        Ok(WorkerQueue::new(receiver))
    }

    async fn active_workers(&self) -> Vec<WorkerInfo> {
        self.workers()
            .values()
            .filter(|worker| !worker.sender.is_closed())
            .map(|worker| WorkerInfo {
                plugin_key: worker.registration.plugin_key.clone(),
                hostname: worker.registration.hostname.clone(),
                capabilities: worker.registration.capabilities.clone(),
                version: worker.registration.info.version.clone(),
            })
            .collect()
    }

    async fn request_info(
        &self,
        plugin_id: &str,
        ttl: Duration,
    ) -> Result<PluginInfo, BrokerError> {
        let found = self
            .workers()
            .values()
            .find(|worker| {
                !worker.sender.is_closed() && worker.registration.info.id == plugin_id
            })
            .map(|worker| worker.registration.info.clone());
        found.ok_or_else(|| BrokerError::InfoNotReceived {
            plugin_id: plugin_id.to_string(),
            ttl_secs: ttl.as_secs(),
        })
    }

    async fn send_compute(
        &self,
        plugin_key: &str,
        command: ComputeCommand,
        options: DispatchOptions,
    ) -> Result<(), BrokerError> {
        let task_id = command.correlation_uuid;
        let (revoke_tx, revoke_rx) = watch::channel(false);
        let expires_at = options.queue_ttl.and_then(|ttl| {
            ChronoDuration::from_std(ttl)
                .ok()
                .map(|ttl| Utc::now() + ttl)
        });
        let task = ComputeTask {
            task_id,
            command,
            time_limit: options.time_limit,
            expires_at,
            revoked: revoke_rx,
        };

        let sender = {
            let workers = self.workers();
            let worker = workers
                .get(plugin_key)
                .filter(|worker| !worker.sender.is_closed())
                .ok_or_else(|| BrokerError::UnknownRoute {
                    plugin_key: plugin_key.to_string(),
                })?;
            worker.sender.clone()
        };

        sender.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => BrokerError::QueueFull {
                plugin_key: plugin_key.to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => BrokerError::UnknownRoute {
                plugin_key: plugin_key.to_string(),
            },
        })?;

        self.revocations().insert(task_id, revoke_tx);
        self.publish_status(task_id, ComputationState::Pending, None);
        debug!(task = %task_id, plugin = %plugin_key, "compute task enqueued");
        Ok(())
    }

    async fn revoke(&self, task_id: Uuid) -> Result<bool, BrokerError> {
        let signalled = match self.revocations().get(&task_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        };
        if signalled {
            info!(task = %task_id, "task revocation signalled");
        }
        Ok(signalled)
    }

    async fn record_task_transition(
        &self,
        meta: &TaskMeta,
        message: Option<String>,
    ) -> Result<(), BrokerError> {
        self.inner.store.record_task_result(meta).await?;
        self.publish_status(meta.task_id, meta.status, message);
        if meta.status.is_terminal() {
            self.revocations().remove(&meta.task_id);
        }
        Ok(())
    }

    fn publish_status(
        &self,
        correlation_uuid: Uuid,
        status: ComputationState,
        message: Option<String>,
    ) {
        debug!(
            exchange = tp_core::NOTIFY_EXCHANGE,
            computation = %correlation_uuid,
            status = status.as_str(),
            "lifecycle event published"
        );
        self.inner
            .bus
            .publish(ComputeCommandResult::now(correlation_uuid, status, message));
    }

    fn subscribe(&self, filter: Option<Uuid>) -> EventSubscription {
        self.inner.bus.subscribe(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;
    use serde_json::json;
    use std::collections::BTreeSet;
    use tp_core::{
        AoiFeature, AoiProperties, Assets, Concern, DemoConfig, MultiPolygon, PluginAuthor,
        PluginState, ShelfLife,
    };
    use tp_store::MemoryStore;

    fn plugin_info() -> PluginInfo {
        PluginInfo {
            id: "tree_cover".into(),
            version: Version::new(3, 1, 0),
            name: "Tree Cover".into(),
            authors: vec![PluginAuthor::named("Jo Field")],
            repository: "https://example.com/tree-cover".into(),
            state: PluginState::Active,
            concerns: [Concern::LandUse].into(),
            teaser: "Estimate tree cover for any area of interest.".into(),
            purpose: "Purpose.".into(),
            methodology: "Methodology.".into(),
            sources: vec![],
            demo_config: DemoConfig {
                params: json!({}),
                name: "Demo".into(),
                aoi: MultiPolygon::bounding_box(0.0, 0.0, 1.0, 1.0),
            },
            computation_shelf_life: ShelfLife::Unbounded,
            assets: Assets::with_icon("icon.png"),
            operator_schema: serde_json::Value::Null,
            library_version: Version::new(1, 0, 0),
        }
    }

    fn registration() -> WorkerRegistration {
        WorkerRegistration {
            plugin_key: "tree_cover;3.1.0".into(),
            hostname: "tree_cover@test-host".into(),
            capabilities: BTreeSet::from(["compute".to_string(), "info".to_string()]),
            info: plugin_info(),
        }
    }

    fn command(task_id: Uuid) -> ComputeCommand {
        ComputeCommand {
            correlation_uuid: task_id,
            aoi: AoiFeature::new(
                MultiPolygon::bounding_box(0.0, 0.0, 1.0, 1.0),
                AoiProperties::new("Box", "box-1"),
            ),
            params: json!({"id": 1}),
        }
    }

    fn broker() -> InProcessBroker {
        InProcessBroker::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn dispatch_reaches_the_bound_queue() {
        let broker = broker();
        let mut queue = broker.register_worker(registration()).await.unwrap();
        let task_id = Uuid::new_v4();

        broker
            .send_compute("tree_cover;3.1.0", command(task_id), DispatchOptions::default())
            .await
            .unwrap();

        let task = queue.next_task().await.unwrap();
        assert_eq!(task.task_id, task_id);
        assert!(!task.is_revoked());
        assert!(!task.is_expired(Utc::now()));
    }

    #[tokio::test]
    async fn dispatch_to_unknown_route_fails() {
        let broker = broker();
        let err = broker
            .send_compute("ghost;1.0.0", command(Uuid::new_v4()), DispatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownRoute { .. }));
    }

    #[tokio::test]
    async fn dispatch_publishes_pending() {
        let broker = broker();
        let _queue = broker.register_worker(registration()).await.unwrap();
        let task_id = Uuid::new_v4();
        let mut sub = broker.subscribe(Some(task_id));

        broker
            .send_compute("tree_cover;3.1.0", command(task_id), DispatchOptions::default())
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.status, ComputationState::Pending);
    }

    #[tokio::test]
    async fn revocation_flips_the_task_signal() {
        let broker = broker();
        let mut queue = broker.register_worker(registration()).await.unwrap();
        let task_id = Uuid::new_v4();
        broker
            .send_compute("tree_cover;3.1.0", command(task_id), DispatchOptions::default())
            .await
            .unwrap();

        assert!(broker.revoke(task_id).await.unwrap());
        let task = queue.next_task().await.unwrap();
        assert!(task.is_revoked());

        // Unknown tasks report no signal.
        assert!(!broker.revoke(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn queue_ttl_marks_tasks_expired() {
        let broker = broker();
        let mut queue = broker.register_worker(registration()).await.unwrap();
        broker
            .send_compute(
                "tree_cover;3.1.0",
                command(Uuid::new_v4()),
                DispatchOptions {
                    time_limit: None,
                    queue_ttl: Some(Duration::from_secs(1)),
                },
            )
            .await
            .unwrap();

        let task = queue.next_task().await.unwrap();
        assert!(!task.is_expired(Utc::now()));
        assert!(task.is_expired(Utc::now() + ChronoDuration::seconds(2)));
    }

    #[tokio::test]
    async fn transition_recording_mirrors_and_publishes() {
        let store = Arc::new(MemoryStore::new());
        let broker = InProcessBroker::new(store.clone());
        let task_id = Uuid::new_v4();
        let mut sub = broker.subscribe(Some(task_id));

        let mut meta = TaskMeta::compute(task_id, ComputationState::Success);
        meta.date_done = Some(Utc::now());
        broker
            .record_task_transition(&meta, Some("done".into()))
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.status, ComputationState::Success);
        assert_eq!(event.message.as_deref(), Some("done"));

        let mirrored = store.read_task_result(task_id).await.unwrap().unwrap();
        assert_eq!(mirrored.status, ComputationState::Success);
    }

    #[tokio::test]
    async fn registry_lists_live_workers() {
        let broker = broker();
        let queue = broker.register_worker(registration()).await.unwrap();
        let workers = broker.active_workers().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].hostname, "tree_cover@test-host");
        assert!(workers[0].capabilities.contains("compute"));

        drop(queue);
        assert!(broker.active_workers().await.is_empty());
    }

    #[tokio::test]
    async fn info_request_times_out_for_unknown_plugin() {
        let broker = broker();
        let err = broker
            .request_info("ghost", Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InfoNotReceived { ttl_secs: 3, .. }));
    }

    #[tokio::test]
    async fn info_request_returns_registered_info() {
        let broker = broker();
        let _queue = broker.register_worker(registration()).await.unwrap();
        let info = broker
            .request_info("tree_cover", Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(info.version, Version::new(3, 1, 0));
    }
}
