// SPDX-License-Identifier: MIT OR Apache-2.0
//! Client-facing dispatch API for Terraplane computations.
//!
//! [`Sender::send_compute`] atomically turns a user request into a
//! running or cached computation: it registers the request, lets the
//! store's uniqueness constraint decide between a fresh computation and
//! an alias onto an existing one, and enqueues a compute task only when
//! this request won the registration. The returned
//! [`ComputationHandle`] follows the (possibly pre-existing) task
//! transparently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use cached::{Cached, TimedCache};
use semver::Version;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tp_broker::{Broker, DispatchOptions, EventSubscription, COMPUTE_CAPABILITY};
use tp_config::SenderSettings;
use tp_core::{
    extract_plugin_id, is_compatible, library_version, AoiFeature, CacheOverride, ComputationInfo,
    ComputationState, ComputeCommand, PluginInfo, PluginRef, ShelfLife,
};
use tp_error::{ErrorCode, PlatformError};
use tp_store::{ComputationRegistration, ComputationStore};
use tracing::{debug, info};
use uuid::Uuid;

/// Lifetime of the plugin-listing cache. Best effort: entries may be up
/// to this much behind the broker's worker registry.
const PLUGIN_LISTING_TTL_SECS: u64 = 60;

/// Holds the platform connections and dispatches computations.
pub struct Sender {
    store: Arc<dyn ComputationStore>,
    broker: Arc<dyn Broker>,
    settings: SenderSettings,
    listing_cache: Mutex<TimedCache<u8, BTreeSet<String>>>,
}

impl Sender {
    /// Create a sender over the given store and broker.
    pub fn new(
        store: Arc<dyn ComputationStore>,
        broker: Arc<dyn Broker>,
        settings: SenderSettings,
    ) -> Self {
        Self {
            store,
            broker,
            settings,
            listing_cache: Mutex::new(TimedCache::with_lifespan(PLUGIN_LISTING_TTL_SECS)),
        }
    }

    /// The set of plugin ids with live compute workers.
    ///
    /// Served from a short-lived cache to reduce broker chatter; the
    /// result may be slightly stale.
    pub async fn list_active_plugins(&self) -> BTreeSet<String> {
        {
            let mut cache = self
                .listing_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.cache_get(&0) {
                return cached.clone();
            }
        }

        let plugins: BTreeSet<String> = self
            .broker
            .active_workers()
            .await
            .into_iter()
            .filter(|worker| worker.capabilities.contains(COMPUTE_CAPABILITY))
            .map(|worker| extract_plugin_id(&worker.hostname).to_string())
            .collect();

        debug!(?plugins, "active plugins");
        self.listing_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cache_set(0, plugins.clone());
        plugins
    }

    /// Fetch a plugin's info: the given version, or the latest one.
    ///
    /// With `assert_plugin_version` enabled this fails when the plugin
    /// was built against a library version incompatible with this
    /// runtime.
    pub async fn request_info(
        &self,
        plugin_id: &str,
        version: Option<&Version>,
    ) -> Result<PluginInfo, PlatformError> {
        debug!(plugin = plugin_id, "requesting info");
        let info = self
            .store
            .read_info(plugin_id, version)
            .await
            .map_err(PlatformError::from)?;

        let local = library_version();
        if self.settings.assert_plugin_version && !is_compatible(&info.library_version, &local) {
            return Err(PlatformError::version_mismatch(format!(
                "Refusing to register plugin {} in version {} due to a library version \
                 mismatch. Local library version: {} <-> Plugin library version: {}",
                info.name, info.version, local, info.library_version
            )));
        }
        Ok(info)
    }

    /// Trigger a computation and return a handle to follow it.
    ///
    /// Equivalent requests within the same cache epoch collapse onto a
    /// single computation; only the winning registration enqueues a
    /// compute task.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_compute(
        &self,
        plugin_id: &str,
        aoi: AoiFeature,
        params: serde_json::Value,
        correlation_uuid: Uuid,
        override_shelf_life: Option<CacheOverride>,
        task_time_limit: Option<Duration>,
        queue_ttl: Option<Duration>,
    ) -> Result<ComputationHandle, PlatformError> {
        let plugin_info = self.request_info(plugin_id, None).await?;

        let shelf_life = match override_shelf_life {
            Some(CacheOverride::Forever) => ShelfLife::Unbounded,
            Some(CacheOverride::Never) => ShelfLife::Seconds(0),
            None if self.settings.deduplicate_computations => plugin_info.computation_shelf_life,
            None => ShelfLife::Seconds(0),
        };

        let plugin = PluginRef {
            id: plugin_info.id.clone(),
            version: plugin_info.version.clone(),
        };
        let registration = ComputationRegistration::new(
            correlation_uuid,
            params.clone(),
            aoi.clone(),
            plugin.clone(),
            shelf_life,
        );
        let canonical = self
            .store
            .register_computation(&registration)
            .await
            .map_err(PlatformError::from)?;

        if canonical == correlation_uuid {
            self.broker
                .send_compute(
                    &plugin.key(),
                    ComputeCommand {
                        correlation_uuid,
                        aoi,
                        params,
                    },
                    DispatchOptions {
                        time_limit: task_time_limit,
                        queue_ttl,
                    },
                )
                .await
                .map_err(PlatformError::from)?;
        } else {
            info!(
                user = %correlation_uuid,
                canonical = %canonical,
                "computation request is deduplicated onto an existing computation"
            );
        }

        Ok(ComputationHandle {
            user_uuid: correlation_uuid,
            canonical_uuid: canonical,
            deduplicated: canonical != correlation_uuid,
            store: Arc::clone(&self.store),
            broker: Arc::clone(&self.broker),
        })
    }
}

// ---------------------------------------------------------------------------
// ComputationHandle
// ---------------------------------------------------------------------------

/// A handle following one (possibly deduplicated) computation.
pub struct ComputationHandle {
    /// The correlation uuid the client asked with.
    pub user_uuid: Uuid,
    /// The canonical computation the request resolved to.
    pub canonical_uuid: Uuid,
    /// Whether the request was aliased onto a pre-existing computation.
    pub deduplicated: bool,
    store: Arc<dyn ComputationStore>,
    broker: Arc<dyn Broker>,
}

impl std::fmt::Debug for ComputationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationHandle")
            .field("user_uuid", &self.user_uuid)
            .field("canonical_uuid", &self.canonical_uuid)
            .field("deduplicated", &self.deduplicated)
            .finish()
    }
}

impl ComputationHandle {
    /// The current lifecycle state of the computation.
    pub async fn state(&self) -> Result<ComputationState, PlatformError> {
        let meta = self
            .store
            .read_task_result(self.canonical_uuid)
            .await
            .map_err(PlatformError::from)?;
        Ok(meta.map(|m| m.status).unwrap_or(ComputationState::Pending))
    }

    /// Subscribe to this computation's lifecycle events.
    pub fn subscribe(&self) -> EventSubscription {
        self.broker.subscribe(Some(self.canonical_uuid))
    }

    /// Wait for the computation to reach a terminal state and return
    /// its record.
    ///
    /// The subscription is opened before the state probe so a
    /// transition between the two cannot be missed.
    pub async fn result(&self, wait: Duration) -> Result<ComputationInfo, PlatformError> {
        let mut events = self.subscribe();

        if !self.state().await?.is_terminal() {
            let deadline = timeout(wait, async {
                while let Some(event) = events.recv().await {
                    if event.status.is_terminal() {
                        return Some(event.status);
                    }
                }
                None
            })
            .await;
            match deadline {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    return Err(PlatformError::new(
                        ErrorCode::Internal,
                        format!(
                            "computation {} did not complete within {:?}",
                            self.canonical_uuid, wait
                        ),
                    ));
                }
            }
        }

        self.store
            .read_computation(self.canonical_uuid)
            .await
            .map_err(PlatformError::from)?
            .ok_or_else(|| {
                PlatformError::storage(format!(
                    "computation {} vanished from the store",
                    self.canonical_uuid
                ))
            })
    }
}
