// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plugin host startup and the serve loop.
//!
//! At startup the host builds the effective plugin info, runs the
//! version guards (no downgrade next to a running newer worker, no
//! silent downgrade of the registered info), writes the info row, and
//! binds the compute/info capabilities on a queue routed by the plugin
//! key. The serve loop then pulls one task at a time and settles each
//! one: expired tasks are discarded, revoked tasks finalise as
//! failures without a message, timed-out tasks as failures with one,
//! and everything else goes through the [`TaskRunner`].

use crate::operator::{enriched_info, Operator};
use crate::runner::{traceback_of, TaskRunner};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tp_broker::{
    Broker, ComputeTask, WorkerQueue, WorkerRegistration, COMPUTE_CAPABILITY, INFO_CAPABILITY,
};
use tp_core::{extract_plugin_id, latest_ordering, ComputationState};
use tp_error::PlatformError;
use tp_object_store::ArtifactStorage;
use tp_store::{ComputationStore, TaskMeta};
use tracing::{info, warn};
use uuid::Uuid;

/// Host startup knobs.
#[derive(Clone, Debug, Default)]
pub struct HostOptions {
    /// Machine part of the worker hostname; defaults to `local`.
    pub hostname: Option<String>,
    /// Force registration even when the store already holds a newer
    /// version of this plugin.
    pub allow_downgrade: bool,
}

/// Register an operator as a plugin worker and return the worker ready
/// to serve its queue.
pub async fn serve_plugin<O: Operator>(
    operator: O,
    store: Arc<dyn ComputationStore>,
    storage: Arc<dyn ArtifactStorage>,
    broker: Arc<dyn Broker>,
    options: HostOptions,
) -> Result<PluginWorker<O>, PlatformError> {
    let plugin_info = enriched_info(&operator)?;

    // A newer worker already serving this plugin blocks the downgrade
    // race where an old binary re-registers over a fresh rollout.
    for worker in broker.active_workers().await {
        if extract_plugin_id(&worker.hostname) == plugin_info.id
            && latest_ordering(&worker.version, &plugin_info.version)
                == std::cmp::Ordering::Greater
        {
            return Err(PlatformError::version_mismatch(format!(
                "refusing to start plugin {} in version {}: a worker with version {} \
                 is already running",
                plugin_info.name, plugin_info.version, worker.version
            )));
        }
    }

    store
        .write_info(&plugin_info, options.allow_downgrade)
        .await
        .map_err(PlatformError::from)?;

    let machine = options.hostname.unwrap_or_else(|| "local".to_string());
    let hostname = format!("{}@{}", plugin_info.id, machine);
    let queue = broker
        .register_worker(WorkerRegistration {
            plugin_key: plugin_info.key(),
            hostname: hostname.clone(),
            capabilities: BTreeSet::from([
                COMPUTE_CAPABILITY.to_string(),
                INFO_CAPABILITY.to_string(),
            ]),
            info: plugin_info.clone(),
        })
        .await
        .map_err(PlatformError::from)?;

    info!(plugin = %plugin_info.key(), hostname = %hostname, "plugin worker registered");

    let runner = TaskRunner::new(Arc::new(operator), plugin_info, Arc::clone(&store), storage);
    Ok(PluginWorker {
        queue,
        runner,
        broker,
        store,
        hostname,
    })
}

/// A bound plugin worker draining its compute queue.
pub struct PluginWorker<O: Operator> {
    queue: WorkerQueue,
    runner: TaskRunner<O>,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ComputationStore>,
    hostname: String,
}

impl<O: Operator> std::fmt::Debug for PluginWorker<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginWorker")
            .field("hostname", &self.hostname)
            .finish()
    }
}

enum Outcome {
    Finished(Result<serde_json::Value, PlatformError>),
    Revoked,
    TimedOut,
}

impl<O: Operator> PluginWorker<O> {
    /// The worker hostname (`"{plugin_id}@{machine}"`).
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The routing key of the bound queue.
    pub fn plugin_key(&self) -> String {
        self.runner.info().key()
    }

    /// Serve tasks until the queue is unbound.
    pub async fn serve(mut self) {
        while self.handle_next().await {}
        info!(worker = %self.hostname, "plugin worker queue closed");
    }

    /// Handle exactly one task. Returns `false` once the queue is gone.
    pub async fn handle_next(&mut self) -> bool {
        match self.queue.next_task().await {
            Some(task) => {
                self.handle_task(task).await;
                true
            }
            None => false,
        }
    }

    async fn handle_task(&self, task: ComputeTask) {
        let task_id = task.task_id;

        if task.is_expired(Utc::now()) {
            warn!(task = %task_id, "discarding task queued past its TTL");
            self.finalize_failure(task_id, Some("expired".to_string()), Some("expired".to_string()))
                .await;
            return;
        }
        if task.is_revoked() {
            self.finalize_revoked(task_id).await;
            return;
        }

        self.record(self.started_meta(task_id), None).await;

        let outcome = {
            let mut revoked = task.revoked.clone();
            let run = self.runner.run(&task);
            tokio::pin!(run);
            let limit = sleep_or_forever(task.time_limit);
            tokio::pin!(limit);
            let revocation = wait_revoked(&mut revoked);
            tokio::pin!(revocation);

            tokio::select! {
                result = &mut run => Outcome::Finished(result),
                _ = &mut revocation => Outcome::Revoked,
                _ = &mut limit => Outcome::TimedOut,
            }
        };

        match outcome {
            Outcome::Finished(Ok(output)) => {
                let mut meta = self.terminal_meta(task_id, ComputationState::Success);
                meta.result = Some(output);
                self.record(meta, None).await;
            }
            Outcome::Finished(Err(err)) => {
                let mut meta = self.terminal_meta(task_id, ComputationState::Failure);
                meta.traceback = Some(traceback_of(&err));
                self.record(meta, Some(err.message.clone())).await;
            }
            Outcome::Revoked => self.finalize_revoked(task_id).await,
            Outcome::TimedOut => {
                let message = "hard time limit exceeded".to_string();
                self.finalize_failure(task_id, Some(message.clone()), Some(message))
                    .await;
            }
        }
    }

    /// Finalise a task that never reached (or never left) the runner as
    /// a failure, both in the lifecycle record and the task mirror.
    async fn finalize_failure(
        &self,
        task_id: Uuid,
        message: Option<String>,
        traceback: Option<String>,
    ) {
        if let Err(err) = self
            .store
            .update_failed_computation(task_id, message.clone(), false)
            .await
        {
            warn!(task = %task_id, error = %err, "failure record could not be written");
        }
        let mut meta = self.terminal_meta(task_id, ComputationState::Failure);
        meta.traceback = traceback;
        self.record(meta, message).await;
    }

    /// A revoked task finalises as a failure with no message and no
    /// cache entry.
    async fn finalize_revoked(&self, task_id: Uuid) {
        if let Err(err) = self
            .store
            .update_failed_computation(task_id, None, false)
            .await
        {
            warn!(task = %task_id, error = %err, "revocation record could not be written");
        }
        self.record(self.terminal_meta(task_id, ComputationState::Revoked), None)
            .await;
    }

    fn started_meta(&self, task_id: Uuid) -> TaskMeta {
        let mut meta = TaskMeta::compute(task_id, ComputationState::Started);
        meta.worker = Some(self.hostname.clone());
        meta.queue = Some(self.plugin_key());
        meta
    }

    fn terminal_meta(&self, task_id: Uuid, status: ComputationState) -> TaskMeta {
        let mut meta = self.started_meta(task_id);
        meta.status = status;
        meta.date_done = Some(Utc::now());
        meta
    }

    async fn record(&self, meta: TaskMeta, message: Option<String>) {
        if let Err(err) = self.broker.record_task_transition(&meta, message).await {
            warn!(task = %meta.task_id, error = %err, "task transition could not be recorded");
        }
    }
}

async fn sleep_or_forever(limit: Option<std::time::Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

async fn wait_revoked(revoked: &mut watch::Receiver<bool>) {
    loop {
        if *revoked.borrow() {
            return;
        }
        if revoked.changed().await.is_err() {
            // The broker dropped the signal; nothing can revoke us now.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::OperatorError;
    use crate::scope::ComputationResources;
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use semver::Version;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;
    use tp_broker::{DispatchOptions, InProcessBroker};
    use tp_core::{
        AoiFeature, AoiProperties, Artifact, ArtifactModality, Assets, Attachments, Concern,
        ComputeCommand, DemoConfig, MultiPolygon, PluginAuthor, PluginInfo, PluginState,
        ShelfLife,
    };
    use tp_object_store::MemoryStorage;
    use tp_store::{ComputationRegistration, MemoryStore};
    use tp_core::PluginRef;

    #[derive(Debug, Deserialize, Serialize, JsonSchema)]
    struct Params {
        /// The record to compute for.
        #[schemars(title = "ID")]
        id: i64,
    }

    struct TestOperator {
        version: Version,
    }

    impl TestOperator {
        fn new() -> Self {
            Self {
                version: Version::new(3, 1, 0),
            }
        }
    }

    #[async_trait]
    impl Operator for TestOperator {
        type Params = Params;

        fn info(&self) -> PluginInfo {
            PluginInfo {
                id: String::new(),
                version: self.version.clone(),
                name: "Test Plugin".into(),
                authors: vec![PluginAuthor::named("Jo Field")],
                repository: "https://example.com/test-plugin".into(),
                state: PluginState::Active,
                concerns: [Concern::LandUse].into(),
                teaser: "Computes a tiny report for testing.".into(),
                purpose: "Purpose.".into(),
                methodology: "Methodology.".into(),
                sources: vec![],
                demo_config: DemoConfig {
                    params: json!({"id": 1}),
                    name: "Demo".into(),
                    aoi: MultiPolygon::bounding_box(0.0, 0.0, 1.0, 1.0),
                },
                computation_shelf_life: ShelfLife::Unbounded,
                assets: Assets::with_icon("icon.png"),
                operator_schema: serde_json::Value::Null,
                library_version: Version::new(0, 0, 0),
            }
        }

        async fn compute(
            &self,
            resources: &mut ComputationResources,
            _aoi: &MultiPolygon,
            _aoi_properties: &AoiProperties,
            params: Self::Params,
        ) -> Result<Vec<Option<Artifact>>, OperatorError> {
            let path = resources.computation_dir.join("report.md");
            std::fs::write(&path, format!("# Report for {}\n", params.id))
                .map_err(|e| OperatorError::Internal(e.into()))?;
            Ok(vec![Some(Artifact {
                name: "Report".into(),
                modality: ArtifactModality::Markdown,
                primary: true,
                tags: Default::default(),
                summary: "A tiny report.".into(),
                description: None,
                filename: "report".into(),
                attachments: Attachments::default(),
                sources: Default::default(),
            })])
        }
    }

    fn aoi() -> AoiFeature {
        AoiFeature::new(
            MultiPolygon::bounding_box(0.0, 0.0, 1.0, 1.0),
            AoiProperties::new("Box", "box-1"),
        )
    }

    struct Rig {
        store: Arc<MemoryStore>,
        storage: Arc<MemoryStorage>,
        broker: InProcessBroker,
    }

    fn rig() -> Rig {
        let store = Arc::new(MemoryStore::new());
        let broker = InProcessBroker::new(store.clone());
        Rig {
            store,
            storage: Arc::new(MemoryStorage::new()),
            broker,
        }
    }

    async fn worker_for(rig: &Rig) -> PluginWorker<TestOperator> {
        serve_plugin(
            TestOperator::new(),
            rig.store.clone(),
            rig.storage.clone(),
            Arc::new(rig.broker.clone()),
            HostOptions::default(),
        )
        .await
        .unwrap()
    }

    async fn register_and_dispatch(
        rig: &Rig,
        plugin_key: &str,
        params: serde_json::Value,
    ) -> Uuid {
        let correlation_uuid = Uuid::new_v4();
        let registration = ComputationRegistration::new(
            correlation_uuid,
            params.clone(),
            aoi(),
            PluginRef {
                id: "test_plugin".into(),
                version: Version::new(3, 1, 0),
            },
            ShelfLife::Unbounded,
        );
        rig.store.register_computation(&registration).await.unwrap();
        rig.broker
            .send_compute(
                plugin_key,
                ComputeCommand {
                    correlation_uuid,
                    aoi: aoi(),
                    params,
                },
                DispatchOptions::default(),
            )
            .await
            .unwrap();
        correlation_uuid
    }

    #[tokio::test]
    async fn startup_registers_info_and_binds_queue() {
        let rig = rig();
        let worker = worker_for(&rig).await;
        assert_eq!(worker.hostname(), "test_plugin@local");
        assert_eq!(worker.plugin_key(), "test_plugin;3.1.0");

        let stored = rig.store.read_info("test_plugin", None).await.unwrap();
        assert_eq!(stored.version, Version::new(3, 1, 0));
        assert!(stored.operator_schema["properties"]["id"].is_object());

        let workers = rig.broker.active_workers().await;
        assert_eq!(workers.len(), 1);
        assert!(workers[0].capabilities.contains("compute"));
        assert!(workers[0].capabilities.contains("info"));
    }

    #[tokio::test]
    async fn startup_refuses_when_store_has_newer_version() {
        let rig = rig();
        let newer = TestOperator {
            version: Version::new(4, 0, 0),
        };
        let newer_info = enriched_info(&newer).unwrap();
        rig.store.write_info(&newer_info, false).await.unwrap();

        let err = serve_plugin(
            TestOperator::new(),
            rig.store.clone(),
            rig.storage.clone(),
            Arc::new(rig.broker.clone()),
            HostOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, tp_error::ErrorCode::VersionMismatch);

        // The override flag forces the downgrade through.
        serve_plugin(
            TestOperator::new(),
            rig.store.clone(),
            rig.storage.clone(),
            Arc::new(rig.broker.clone()),
            HostOptions {
                allow_downgrade: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn startup_refuses_next_to_a_running_newer_worker() {
        let rig = rig();
        let newer = TestOperator {
            version: Version::new(4, 0, 0),
        };
        let _running = serve_plugin(
            newer,
            rig.store.clone(),
            rig.storage.clone(),
            Arc::new(rig.broker.clone()),
            HostOptions::default(),
        )
        .await
        .unwrap();

        let err = serve_plugin(
            TestOperator::new(),
            rig.store.clone(),
            rig.storage.clone(),
            Arc::new(rig.broker.clone()),
            HostOptions {
                allow_downgrade: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(err.message.contains("already running"));
    }

    #[tokio::test]
    async fn happy_path_records_success_and_uploads_artifacts() {
        let rig = rig();
        let mut worker = worker_for(&rig).await;
        let uuid = register_and_dispatch(&rig, "test_plugin;3.1.0", json!({"id": 1})).await;

        assert!(worker.handle_next().await);

        let record = rig.store.read_computation(uuid).await.unwrap().unwrap();
        assert_eq!(record.status, Some(ComputationState::Success));
        assert_eq!(record.artifacts.len(), 1);
        assert_eq!(record.artifacts[0].rank, 0);
        assert_eq!(record.artifacts[0].filename, "report");
        assert_eq!(record.params, Some(json!({"id": 1})));

        // Data blob, its metadata sibling, and the computation-info pair.
        assert_eq!(rig.storage.blob_count(), 4);

        let meta = rig.store.read_task_result(uuid).await.unwrap().unwrap();
        assert_eq!(meta.status, ComputationState::Success);
        assert_eq!(meta.worker.as_deref(), Some("test_plugin@local"));
    }

    #[tokio::test]
    async fn invalid_input_fails_with_pretty_message_and_cached_failure() {
        let rig = rig();
        let mut worker = worker_for(&rig).await;
        let uuid = register_and_dispatch(&rig, "test_plugin;3.1.0", json!({"id": "abc"})).await;

        assert!(worker.handle_next().await);

        let record = rig.store.read_computation(uuid).await.unwrap().unwrap();
        assert_eq!(record.status, Some(ComputationState::Failure));
        let message = record.message.unwrap();
        assert!(message.starts_with("ID: "), "got: {message}");
        assert!(message.ends_with("You provided: abc."), "got: {message}");
        // Input-validation failures are cached forever.
        assert_eq!(record.cache_epoch, Some(0));

        let meta = rig.store.read_task_result(uuid).await.unwrap().unwrap();
        assert!(meta.traceback.unwrap().starts_with("INPUT_VALIDATION"));
    }

    #[tokio::test]
    async fn revoked_task_finalizes_without_message() {
        let rig = rig();
        let mut worker = worker_for(&rig).await;
        let uuid = register_and_dispatch(&rig, "test_plugin;3.1.0", json!({"id": 1})).await;

        rig.broker.revoke(uuid).await.unwrap();
        assert!(worker.handle_next().await);

        let record = rig.store.read_computation(uuid).await.unwrap().unwrap();
        assert_eq!(record.status, Some(ComputationState::Revoked));
        assert_eq!(record.message, None);
        assert_eq!(record.cache_epoch, None);
    }
}
