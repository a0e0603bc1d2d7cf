// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-task lifecycle.
//!
//! One task runs as: validate parameters against the plugin schema,
//! persist the validated form, enter a computation scope, invoke the
//! operator, upload artifacts, write the final computation-info blob,
//! and record the outcome atomically. Any error before the final store
//! update turns into a failure record (cached only for
//! input-validation errors) and is re-raised so the dispatch fabric
//! marks the task failed.
//!
//! All semantic state is written here, by "user code", before the
//! broker's bookkeeping runs; the broker callbacks must never mutate
//! platform state themselves.

use crate::operator::Operator;
use crate::scope::ComputationScope;
use crate::validate::validate_params;
use chrono::Utc;
use std::sync::Arc;
use tp_broker::ComputeTask;
use tp_core::{
    enrich_artifacts, Artifact, ArtifactEnriched, ComputationState, PluginInfo,
    COMPUTATION_INFO_FILENAME,
};
use tp_error::PlatformError;
use tp_object_store::ArtifactStorage;
use tp_store::ComputationStore;
use tracing::{debug, error};

/// Drives single compute tasks through their lifecycle.
pub struct TaskRunner<O: Operator> {
    operator: Arc<O>,
    info: PluginInfo,
    store: Arc<dyn ComputationStore>,
    storage: Arc<dyn ArtifactStorage>,
}

impl<O: Operator> TaskRunner<O> {
    /// Create a runner for one hosted operator with its enriched info.
    pub fn new(
        operator: Arc<O>,
        info: PluginInfo,
        store: Arc<dyn ComputationStore>,
        storage: Arc<dyn ArtifactStorage>,
    ) -> Self {
        Self {
            operator,
            info,
            store,
            storage,
        }
    }

    /// The enriched info of the hosted plugin.
    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    /// Run one task to completion and return the final computation
    /// record as the task result payload.
    ///
    /// On error the computation is recorded as failed (cached only for
    /// input-validation failures) before the error is re-raised.
    pub async fn run(&self, task: &ComputeTask) -> Result<serde_json::Value, PlatformError> {
        let correlation_uuid = task.task_id;
        match self.run_inner(task).await {
            Ok(output) => Ok(output),
            Err(err) => {
                let recorded = self
                    .store
                    .update_failed_computation(
                        correlation_uuid,
                        Some(err.message.clone()),
                        err.caches_failure(),
                    )
                    .await;
                if let Err(store_err) = recorded {
                    error!(
                        computation = %correlation_uuid,
                        error = %store_err,
                        "failed to record computation failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run_inner(&self, task: &ComputeTask) -> Result<serde_json::Value, PlatformError> {
        let correlation_uuid = task.task_id;
        debug!(computation = %correlation_uuid, "acquired compute request");

        let aoi = &task.command.aoi;

        validate_params(&self.info.operator_schema, &task.command.params)?;
        let params: O::Params = serde_json::from_value(task.command.params.clone())
            .map_err(|e| PlatformError::input_validation(e.to_string()))?;
        let validated = serde_json::to_value(&params)
            .map_err(|e| PlatformError::internal(format!("validated params not serialisable: {e}")))?;
        self.store
            .add_validated_params(correlation_uuid, &validated)
            .await
            .map_err(PlatformError::from)?;
        debug!(computation = %correlation_uuid, "compute parameters validated");

        let mut scope = ComputationScope::new(correlation_uuid)
            .map_err(|e| PlatformError::internal(format!("computation scope setup failed: {e}")))?;

        let artifacts = self
            .operator
            .compute(scope.resources_mut(), &aoi.geometry, &aoi.properties, params)
            .await
            .map_err(PlatformError::from)?;

        let artifacts: Vec<Artifact> = artifacts.into_iter().flatten().collect();
        if artifacts.is_empty() {
            return Err(PlatformError::internal(
                "the computation returned no results",
            ));
        }

        let enriched = enrich_artifacts(
            artifacts,
            correlation_uuid,
            &self.info.assets.sources_library,
        )
        .map_err(|e| PlatformError::internal(e.to_string()))?;

        self.storage
            .save_all(&enriched, &scope.resources().computation_dir)
            .await
            .map_err(|e| PlatformError::storage(e.to_string()).with_source(e))?;
        let artifact_errors = scope.resources().artifact_errors.clone();
        drop(scope);

        let mut record = self
            .store
            .read_computation(correlation_uuid)
            .await
            .map_err(PlatformError::from)?
            .ok_or_else(|| {
                PlatformError::storage(format!(
                    "computation {correlation_uuid} is not registered"
                ))
            })?;
        record.completed_ts = Some(Utc::now());
        record.params = Some(validated);
        record.artifacts = enriched;
        record.artifact_errors = artifact_errors;
        record.status = Some(ComputationState::Success);

        self.save_computation_info(&record).await?;

        let invalidate_cache = !record.artifact_errors.is_empty();
        self.store
            .update_successful_computation(&record, invalidate_cache)
            .await
            .map_err(PlatformError::from)?;
        debug!(computation = %correlation_uuid, "successfully completed");

        serde_json::to_value(&record)
            .map_err(|e| PlatformError::internal(format!("computation record not serialisable: {e}")))
    }

    /// Persist the final computation record as a metadata artifact,
    /// ranked after every operator artifact.
    async fn save_computation_info(
        &self,
        record: &tp_core::ComputationInfo,
    ) -> Result<(), PlatformError> {
        let rank = record.artifacts.len() as u32;
        let descriptor = ArtifactEnriched::computation_info(record.correlation_uuid, rank);

        let dir = tempfile::tempdir()
            .map_err(|e| PlatformError::internal(format!("metadata scratch dir failed: {e}")))?;
        let body = serde_json::to_vec(record)
            .map_err(|e| PlatformError::internal(format!("computation info not serialisable: {e}")))?;
        tokio::fs::write(dir.path().join(COMPUTATION_INFO_FILENAME), body)
            .await
            .map_err(|e| PlatformError::internal(format!("metadata file write failed: {e}")))?;

        self.storage
            .save(&descriptor, dir.path())
            .await
            .map_err(|e| PlatformError::storage(e.to_string()).with_source(e))?;
        Ok(())
    }
}

/// Build the traceback string mirrored into the task side table; it
/// leads with the stable error code so reporting views can classify
/// failure causes.
pub fn traceback_of(err: &PlatformError) -> String {
    format!("{}: {}", err.code.as_str(), err.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceback_carries_the_stable_code() {
        let err = PlatformError::input_validation("ID: not an integer. You provided: abc.");
        let traceback = traceback_of(&err);
        assert!(traceback.starts_with("INPUT_VALIDATION: "));
        assert!(traceback.contains("not an integer"));
    }
}
