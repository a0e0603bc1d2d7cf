// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory implementation of the [`ComputationStore`] trait.
//!
//! One mutex serialises all mutations, which makes the deduplication
//! decision trivially linearizable. The observable semantics mirror the
//! PostgreSQL implementation, including the rule that rows without a
//! cache epoch never deduplicate.

use crate::{ComputationRegistration, ComputationStore, StoreError, TaskMeta};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tp_core::{
    cache_slot, deduplication_key, far_future, latest_ordering, AoiFeature, AoiProperties,
    ArtifactEnriched, ComputationInfo, ComputationState, MultiPolygon, PluginInfo, PluginRef,
};
use tracing::debug;
use uuid::Uuid;

struct ComputationRow {
    correlation_uuid: Uuid,
    request_ts: DateTime<Utc>,
    plugin: PluginRef,
    deduplication_key: Uuid,
    cache_epoch: Option<i64>,
    valid_until: DateTime<Utc>,
    params: Option<serde_json::Value>,
    requested_params: serde_json::Value,
    geometry: MultiPolygon,
    message: Option<String>,
    artifact_errors: BTreeMap<String, String>,
    completed_ts: Option<DateTime<Utc>>,
}

struct LookupRow {
    request_ts: DateTime<Utc>,
    properties: AoiProperties,
    computation_id: Uuid,
}

#[derive(Default)]
struct Inner {
    infos: BTreeMap<String, PluginInfo>,
    latest: BTreeMap<String, String>,
    computations: HashMap<Uuid, ComputationRow>,
    dedup_index: HashMap<(String, Uuid, i64), Uuid>,
    lookups: HashMap<Uuid, LookupRow>,
    artifacts: HashMap<Uuid, Vec<ArtifactEnriched>>,
    taskmeta: HashMap<Uuid, TaskMeta>,
}

/// Mutex-serialised in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic inside another accessor; the data
        // is still structurally sound for reads and tests.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn recompute_latest(&mut self, plugin_id: &str) {
        let best = self
            .infos
            .values()
            .filter(|i| i.id == plugin_id)
            .max_by(|a, b| latest_ordering(&a.version, &b.version))
            .map(|i| i.key());
        match best {
            Some(key) => {
                self.latest.insert(plugin_id.to_string(), key);
            }
            None => {
                self.latest.remove(plugin_id);
            }
        }
    }

    fn computation_info(
        &self,
        lookup: &LookupRow,
        row: &ComputationRow,
    ) -> ComputationInfo {
        let mut artifacts = self
            .artifacts
            .get(&row.correlation_uuid)
            .cloned()
            .unwrap_or_default();
        artifacts.sort_by_key(|a| a.rank);

        let status = self
            .taskmeta
            .get(&row.correlation_uuid)
            .map(|meta| meta.status)
            .or(Some(ComputationState::Pending));

        ComputationInfo {
            correlation_uuid: row.correlation_uuid,
            request_ts: row.request_ts,
            deduplication_key: row.deduplication_key,
            cache_epoch: row.cache_epoch,
            valid_until: row.valid_until,
            params: row.params.clone(),
            requested_params: row.requested_params.clone(),
            aoi: AoiFeature::new(row.geometry.clone(), lookup.properties.clone()),
            artifacts,
            plugin: row.plugin.clone(),
            status,
            message: row.message.clone(),
            artifact_errors: row.artifact_errors.clone(),
            completed_ts: row.completed_ts,
        }
    }
}

#[async_trait]
impl ComputationStore for MemoryStore {
    async fn write_info(
        &self,
        info: &PluginInfo,
        allow_downgrade: bool,
    ) -> Result<String, StoreError> {
        let mut inner = self.lock();

        if !allow_downgrade {
            if let Some(existing) = inner
                .infos
                .values()
                .filter(|i| i.id == info.id)
                .max_by(|a, b| latest_ordering(&a.version, &b.version))
            {
                if latest_ordering(&existing.version, &info.version) == std::cmp::Ordering::Greater
                {
                    return Err(StoreError::DowngradeRefused {
                        name: info.name.clone(),
                        version: info.version.clone(),
                        existing: existing.version.clone(),
                    });
                }
            }
        }

        let key = info.key();
        inner.infos.insert(key.clone(), info.clone());
        inner.recompute_latest(&info.id);
        debug!(plugin = %key, "plugin info written");
        Ok(key)
    }

    async fn read_info(
        &self,
        plugin_id: &str,
        version: Option<&Version>,
    ) -> Result<PluginInfo, StoreError> {
        let inner = self.lock();
        let key = match version {
            Some(version) => format!("{plugin_id};{version}"),
            None => inner
                .latest
                .get(plugin_id)
                .cloned()
                .ok_or_else(|| StoreError::InfoNotFound {
                    plugin_id: plugin_id.to_string(),
                })?,
        };
        inner
            .infos
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::InfoNotFound {
                plugin_id: plugin_id.to_string(),
            })
    }

    async fn list_infos(&self) -> Result<Vec<PluginInfo>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .latest
            .values()
            .filter_map(|key| inner.infos.get(key))
            .cloned()
            .collect())
    }

    async fn register_computation(
        &self,
        registration: &ComputationRegistration,
    ) -> Result<Uuid, StoreError> {
        let mut inner = self.lock();

        let plugin_key = registration.plugin.key();
        if !inner.infos.contains_key(&plugin_key) {
            return Err(StoreError::InfoNotFound {
                plugin_id: registration.plugin.id.clone(),
            });
        }

        let slot = cache_slot(registration.request_ts, registration.shelf_life);
        let wkt = registration.aoi.to_wkt();
        let dedup_key = deduplication_key(&registration.requested_params, &wkt);

        let canonical = match slot.cache_epoch {
            Some(epoch) => inner
                .dedup_index
                .get(&(plugin_key.clone(), dedup_key, epoch))
                .copied(),
            // No cache epoch: rows never conflict, always a fresh one.
            None => None,
        };

        let canonical = match canonical {
            Some(existing) => {
                debug!(
                    user = %registration.correlation_uuid,
                    canonical = %existing,
                    "computation request deduplicated"
                );
                existing
            }
            None => {
                let row = ComputationRow {
                    correlation_uuid: registration.correlation_uuid,
                    request_ts: registration.request_ts,
                    plugin: registration.plugin.clone(),
                    deduplication_key: dedup_key,
                    cache_epoch: slot.cache_epoch,
                    valid_until: slot.valid_until,
                    params: None,
                    requested_params: registration.requested_params.clone(),
                    geometry: registration.aoi.geometry.clone(),
                    message: None,
                    artifact_errors: BTreeMap::new(),
                    completed_ts: None,
                };
                inner.computations.insert(registration.correlation_uuid, row);
                if let Some(epoch) = slot.cache_epoch {
                    inner
                        .dedup_index
                        .insert((plugin_key, dedup_key, epoch), registration.correlation_uuid);
                }
                registration.correlation_uuid
            }
        };

        inner
            .lookups
            .entry(registration.correlation_uuid)
            .or_insert_with(|| LookupRow {
                request_ts: registration.request_ts,
                properties: registration.aoi.properties.clone(),
                computation_id: canonical,
            });

        Ok(canonical)
    }

    async fn add_validated_params(
        &self,
        correlation_uuid: Uuid,
        params: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let row = inner
            .computations
            .get_mut(&correlation_uuid)
            .ok_or(StoreError::ComputationNotFound(correlation_uuid))?;
        row.params = Some(params.clone());
        Ok(())
    }

    async fn read_computation(
        &self,
        user_correlation_uuid: Uuid,
    ) -> Result<Option<ComputationInfo>, StoreError> {
        let inner = self.lock();
        let Some(lookup) = inner.lookups.get(&user_correlation_uuid) else {
            return Ok(None);
        };
        let Some(row) = inner.computations.get(&lookup.computation_id) else {
            return Ok(None);
        };
        Ok(Some(inner.computation_info(lookup, row)))
    }

    async fn resolve_computation_id(
        &self,
        user_correlation_uuid: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .lookups
            .get(&user_correlation_uuid)
            .map(|l| l.computation_id))
    }

    async fn update_successful_computation(
        &self,
        info: &ComputationInfo,
        invalidate_cache: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();

        if !inner.computations.contains_key(&info.correlation_uuid) {
            return Err(StoreError::ComputationNotFound(info.correlation_uuid));
        }
        inner
            .artifacts
            .insert(info.correlation_uuid, info.artifacts.clone());

        let row = inner
            .computations
            .get_mut(&info.correlation_uuid)
            .ok_or(StoreError::ComputationNotFound(info.correlation_uuid))?;
        row.message = info.message.clone();
        row.artifact_errors = info.artifact_errors.clone();
        row.completed_ts = info.completed_ts;
        row.params = info.params.clone();

        if invalidate_cache {
            let released = row.cache_epoch.take();
            row.valid_until = info.completed_ts.unwrap_or_else(Utc::now);
            let plugin_key = row.plugin.key();
            let dedup_key = row.deduplication_key;
            if let Some(epoch) = released {
                inner.dedup_index.remove(&(plugin_key, dedup_key, epoch));
            }
        }
        Ok(())
    }

    async fn update_failed_computation(
        &self,
        correlation_uuid: Uuid,
        message: Option<String>,
        cache: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();

        let row = inner
            .computations
            .get_mut(&correlation_uuid)
            .ok_or(StoreError::ComputationNotFound(correlation_uuid))?;
        let plugin_key = row.plugin.key();
        let dedup_key = row.deduplication_key;
        let released = row.cache_epoch.take();

        row.message = message;
        row.completed_ts = Some(now);
        if cache {
            // Keep the failure forever so identical bad input never re-runs.
            row.cache_epoch = Some(0);
            row.valid_until = far_future();
        } else {
            row.valid_until = now;
        }
        let new_epoch = row.cache_epoch;

        if let Some(epoch) = released {
            inner
                .dedup_index
                .remove(&(plugin_key.clone(), dedup_key, epoch));
        }
        if let Some(epoch) = new_epoch {
            inner
                .dedup_index
                .insert((plugin_key, dedup_key, epoch), correlation_uuid);
        }
        Ok(())
    }

    async fn list_artifacts(
        &self,
        correlation_uuid: Uuid,
    ) -> Result<Vec<ArtifactEnriched>, StoreError> {
        let inner = self.lock();
        let mut artifacts = inner
            .artifacts
            .get(&correlation_uuid)
            .cloned()
            .unwrap_or_default();
        artifacts.sort_by_key(|a| a.rank);
        Ok(artifacts)
    }

    async fn record_task_result(&self, meta: &TaskMeta) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.taskmeta.insert(meta.task_id, meta.clone());
        Ok(())
    }

    async fn read_task_result(&self, task_id: Uuid) -> Result<Option<TaskMeta>, StoreError> {
        let inner = self.lock();
        Ok(inner.taskmeta.get(&task_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::collections::BTreeSet;
    use tp_core::{
        ArtifactModality, Assets, Attachments, Concern, DemoConfig, PluginAuthor, PluginState,
        ShelfLife,
    };

    fn info(version: &str) -> PluginInfo {
        PluginInfo {
            id: "tree_cover".into(),
            version: Version::parse(version).unwrap(),
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

    fn aoi() -> AoiFeature {
        AoiFeature::new(
            MultiPolygon::bounding_box(0.0, 0.0, 1.0, 1.0),
            AoiProperties::new("Box", "box-1"),
        )
    }

    fn registration(shelf_life: ShelfLife) -> ComputationRegistration {
        ComputationRegistration::new(
            Uuid::new_v4(),
            json!({"id": 1}),
            aoi(),
            PluginRef {
                id: "tree_cover".into(),
                version: Version::new(3, 1, 0),
            },
            shelf_life,
        )
    }

    async fn store_with_plugin() -> MemoryStore {
        let store = MemoryStore::new();
        store.write_info(&info("3.1.0"), false).await.unwrap();
        store
    }

    // -- Info ------------------------------------------------------------

    #[tokio::test]
    async fn read_info_returns_latest_by_default() {
        let store = MemoryStore::new();
        store.write_info(&info("1.0.0"), false).await.unwrap();
        store.write_info(&info("1.2.0"), false).await.unwrap();
        let read = store.read_info("tree_cover", None).await.unwrap();
        assert_eq!(read.version, Version::new(1, 2, 0));
    }

    #[tokio::test]
    async fn read_info_by_specific_version() {
        let store = MemoryStore::new();
        store.write_info(&info("1.0.0"), false).await.unwrap();
        store.write_info(&info("1.2.0"), false).await.unwrap();
        let read = store
            .read_info("tree_cover", Some(&Version::new(1, 0, 0)))
            .await
            .unwrap();
        assert_eq!(read.version, Version::new(1, 0, 0));
    }

    #[tokio::test]
    async fn downgrade_refused_without_override() {
        let store = MemoryStore::new();
        store.write_info(&info("2.0.0"), false).await.unwrap();
        let err = store.write_info(&info("1.9.0"), false).await.unwrap_err();
        assert!(matches!(err, StoreError::DowngradeRefused { .. }));
        // The override forces the registration through.
        store.write_info(&info("1.9.0"), true).await.unwrap();
    }

    #[tokio::test]
    async fn exactly_one_latest_per_plugin_id() {
        let store = MemoryStore::new();
        store.write_info(&info("1.0.0"), false).await.unwrap();
        store.write_info(&info("2.0.0"), false).await.unwrap();
        let latest = store.list_infos().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, Version::new(2, 0, 0));
    }

    #[tokio::test]
    async fn unknown_plugin_reported() {
        let store = MemoryStore::new();
        let err = store.read_info("ghost", None).await.unwrap_err();
        assert!(matches!(err, StoreError::InfoNotFound { .. }));
    }

    // -- Registration & deduplication ------------------------------------

    #[tokio::test]
    async fn equivalent_requests_collapse_onto_one_row() {
        let store = store_with_plugin().await;
        let first = registration(ShelfLife::Unbounded);
        let mut second = registration(ShelfLife::Unbounded);
        second.request_ts = first.request_ts;

        let canonical_a = store.register_computation(&first).await.unwrap();
        let canonical_b = store.register_computation(&second).await.unwrap();

        assert_eq!(canonical_a, first.correlation_uuid);
        assert_eq!(canonical_b, canonical_a, "loser receives the winner's uuid");
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let store = store_with_plugin().await;
        let reg = registration(ShelfLife::Unbounded);
        let a = store.register_computation(&reg).await.unwrap();
        let b = store.register_computation(&reg).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(
            store.resolve_computation_id(reg.correlation_uuid).await.unwrap(),
            Some(a)
        );
    }

    #[tokio::test]
    async fn zero_shelf_life_never_deduplicates() {
        let store = store_with_plugin().await;
        let first = registration(ShelfLife::Seconds(0));
        let mut second = registration(ShelfLife::Seconds(0));
        second.request_ts = first.request_ts;

        let a = store.register_computation(&first).await.unwrap();
        let b = store.register_computation(&second).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn expired_shelf_life_starts_a_new_computation() {
        let store = store_with_plugin().await;
        let first = registration(ShelfLife::days(7));
        let mut second = registration(ShelfLife::days(7));
        second.request_ts = first.request_ts + Duration::days(7) + Duration::seconds(1);

        let a = store.register_computation(&first).await.unwrap();
        let b = store.register_computation(&second).await.unwrap();
        assert_ne!(a, b, "a later bucket gets a fresh computation");
    }

    #[tokio::test]
    async fn different_params_do_not_deduplicate() {
        let store = store_with_plugin().await;
        let first = registration(ShelfLife::Unbounded);
        let mut second = registration(ShelfLife::Unbounded);
        second.requested_params = json!({"id": 2});
        second.request_ts = first.request_ts;

        let a = store.register_computation(&first).await.unwrap();
        let b = store.register_computation(&second).await.unwrap();
        assert_ne!(a, b);
    }

    // -- Lifecycle updates ------------------------------------------------

    async fn registered(store: &MemoryStore) -> ComputationInfo {
        let reg = registration(ShelfLife::Unbounded);
        let canonical = store.register_computation(&reg).await.unwrap();
        store.read_computation(canonical).await.unwrap().unwrap()
    }

    fn enriched(correlation_uuid: Uuid, rank: u32, name: &str) -> ArtifactEnriched {
        ArtifactEnriched {
            correlation_uuid,
            rank,
            name: name.into(),
            modality: ArtifactModality::Markdown,
            primary: true,
            tags: BTreeSet::new(),
            summary: "s".into(),
            description: None,
            filename: format!("file_{rank}"),
            attachments: Attachments::default(),
            sources: vec![],
        }
    }

    #[tokio::test]
    async fn successful_update_persists_artifacts_in_rank_order() {
        let store = store_with_plugin().await;
        let mut info = registered(&store).await;
        info.artifacts = vec![
            enriched(info.correlation_uuid, 1, "B"),
            enriched(info.correlation_uuid, 0, "A"),
        ];
        info.completed_ts = Some(Utc::now());
        store
            .update_successful_computation(&info, false)
            .await
            .unwrap();

        let artifacts = store.list_artifacts(info.correlation_uuid).await.unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].name, "A");
        assert_eq!(artifacts[1].name, "B");
    }

    #[tokio::test]
    async fn artifact_errors_invalidate_the_cache() {
        let store = store_with_plugin().await;
        let mut info = registered(&store).await;
        info.artifact_errors
            .insert("Artifact Two".into(), "data unavailable".into());
        info.completed_ts = Some(Utc::now());
        store
            .update_successful_computation(&info, true)
            .await
            .unwrap();

        let read = store
            .read_computation(info.correlation_uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.cache_epoch, None);
        assert!(read.valid_until <= Utc::now());
        assert_eq!(read.artifact_errors["Artifact Two"], "data unavailable");

        // The slot is free again: an equivalent request creates a new row.
        let mut again = registration(ShelfLife::Unbounded);
        again.request_ts = read.request_ts;
        let canonical = store.register_computation(&again).await.unwrap();
        assert_ne!(canonical, info.correlation_uuid);
    }

    #[tokio::test]
    async fn cached_failure_is_kept_forever() {
        let store = store_with_plugin().await;
        let info = registered(&store).await;
        store
            .update_failed_computation(
                info.correlation_uuid,
                Some("ID: Input should be a valid integer. You provided: abc.".into()),
                true,
            )
            .await
            .unwrap();

        let read = store
            .read_computation(info.correlation_uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.cache_epoch, Some(0));
        assert_eq!(read.valid_until, far_future());
        assert!(read.message.as_deref().unwrap().contains("valid integer"));

        // Identical input keeps hitting the cached failure.
        let mut again = registration(ShelfLife::Unbounded);
        again.request_ts = read.request_ts;
        let canonical = store.register_computation(&again).await.unwrap();
        assert_eq!(canonical, info.correlation_uuid);
    }

    #[tokio::test]
    async fn uncached_failure_expires_immediately() {
        let store = store_with_plugin().await;
        let info = registered(&store).await;
        store
            .update_failed_computation(info.correlation_uuid, None, false)
            .await
            .unwrap();
        let read = store
            .read_computation(info.correlation_uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.cache_epoch, None);
        assert!(read.valid_until <= Utc::now());
        assert_eq!(read.message, None);
    }

    #[tokio::test]
    async fn validated_params_are_attached() {
        let store = store_with_plugin().await;
        let info = registered(&store).await;
        store
            .add_validated_params(info.correlation_uuid, &json!({"id": 1, "extra": "default"}))
            .await
            .unwrap();
        let read = store
            .read_computation(info.correlation_uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.params, Some(json!({"id": 1, "extra": "default"})));
    }

    // -- Task meta --------------------------------------------------------

    #[tokio::test]
    async fn task_meta_upserts_by_task_id() {
        let store = MemoryStore::new();
        let task_id = Uuid::new_v4();
        store
            .record_task_result(&TaskMeta::compute(task_id, ComputationState::Started))
            .await
            .unwrap();
        let mut done = TaskMeta::compute(task_id, ComputationState::Success);
        done.date_done = Some(Utc::now());
        store.record_task_result(&done).await.unwrap();

        let read = store.read_task_result(task_id).await.unwrap().unwrap();
        assert_eq!(read.status, ComputationState::Success);
        assert!(read.date_done.is_some());
    }

    #[tokio::test]
    async fn status_is_reported_from_task_meta() {
        let store = store_with_plugin().await;
        let info = registered(&store).await;
        assert_eq!(info.status, Some(ComputationState::Pending));

        store
            .record_task_result(&TaskMeta::compute(
                info.correlation_uuid,
                ComputationState::Started,
            ))
            .await
            .unwrap();
        let read = store
            .read_computation(info.correlation_uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.status, Some(ComputationState::Started));
    }
}
