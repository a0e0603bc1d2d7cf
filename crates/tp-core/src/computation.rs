// SPDX-License-Identifier: MIT OR Apache-2.0
//! Computation lifecycle records and cache arithmetic.
//!
//! A computation is one end-to-end plugin invocation over one
//! `(params, AOI)` pair. Equivalent requests are collapsed onto a single
//! row via the triple `(plugin_key, deduplication_key, cache_epoch)`:
//! the deduplication key is a deterministic digest of the requested
//! parameters and the AOI geometry, and the cache epoch indexes fixed
//! time buckets of width *shelf life* starting at the Unix epoch.

use crate::aoi::AoiFeature;
use crate::artifact::ArtifactEnriched;
use crate::info::PLUGIN_KEY_SEPARATOR;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Shelf life
// ---------------------------------------------------------------------------

/// Cache-bucket width for a plugin's computations.
///
/// `Unbounded` caches forever; `Seconds(0)` never caches; any positive
/// width makes results valid within fixed time frames of that width,
/// anchored at Unix timestamp zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<u64>", into = "Option<u64>")]
pub enum ShelfLife {
    /// Computations never expire.
    Unbounded,
    /// Bucket width in whole seconds; zero disables caching.
    Seconds(u64),
}

impl ShelfLife {
    /// Shelf life of the given number of whole days.
    pub fn days(days: u64) -> Self {
        Self::Seconds(days * 86_400)
    }

    /// Whether computations are cached forever.
    pub fn is_unbounded(&self) -> bool {
        matches!(self, Self::Unbounded)
    }

    /// Whether caching is disabled.
    pub fn is_zero(&self) -> bool {
        matches!(self, Self::Seconds(0))
    }
}

impl Default for ShelfLife {
    fn default() -> Self {
        Self::Seconds(0)
    }
}

impl From<Option<u64>> for ShelfLife {
    fn from(value: Option<u64>) -> Self {
        match value {
            None => Self::Unbounded,
            Some(secs) => Self::Seconds(secs),
        }
    }
}

impl From<ShelfLife> for Option<u64> {
    fn from(value: ShelfLife) -> Self {
        match value {
            ShelfLife::Unbounded => None,
            ShelfLife::Seconds(secs) => Some(secs),
        }
    }
}

/// Per-request override of a plugin's shelf life.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOverride {
    /// Cache the result forever.
    Forever,
    /// Do not cache the result.
    Never,
}

// ---------------------------------------------------------------------------
// Cache slot
// ---------------------------------------------------------------------------

/// The cache coordinates of a request: its epoch and expiry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheSlot {
    /// Bucket index, or `None` when the computation is not cacheable.
    pub cache_epoch: Option<i64>,
    /// Instant after which the computation may no longer be reused.
    pub valid_until: DateTime<Utc>,
}

/// The far-future timestamp standing in for "never expires".
pub fn far_future() -> DateTime<Utc> {
    // 9999-12-31T23:59:59Z.
    DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Compute the cache slot of a request at `request_ts` under `shelf_life`.
///
/// * Unbounded ⇒ epoch 0, valid forever.
/// * Zero ⇒ no epoch, already expired at the request timestamp.
/// * Width `s` ⇒ epoch `⌊unix_seconds / s⌋`, valid until `(epoch + 1)·s`.
pub fn cache_slot(request_ts: DateTime<Utc>, shelf_life: ShelfLife) -> CacheSlot {
    match shelf_life {
        ShelfLife::Unbounded => CacheSlot {
            cache_epoch: Some(0),
            valid_until: far_future(),
        },
        ShelfLife::Seconds(0) => CacheSlot {
            cache_epoch: None,
            valid_until: request_ts,
        },
        ShelfLife::Seconds(secs) => {
            let width = secs as i64;
            let epoch = request_ts.timestamp().div_euclid(width);
            let valid_until = DateTime::from_timestamp((epoch + 1) * width, 0)
                .unwrap_or_else(far_future);
            CacheSlot {
                cache_epoch: Some(epoch),
                valid_until,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Deduplication key
// ---------------------------------------------------------------------------

/// Derive the deduplication key of a request.
///
/// The key is a UUID computed over the canonical JSON of the requested
/// parameters concatenated with the WKT of the AOI geometry. Object keys
/// in the parameter JSON are ordered, so semantically equal requests
/// yield equal keys.
pub fn deduplication_key(requested_params: &serde_json::Value, aoi_wkt: &str) -> Uuid {
    let content = format!("{requested_params}{aoi_wkt}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, content.as_bytes())
}

// ---------------------------------------------------------------------------
// Lifecycle states
// ---------------------------------------------------------------------------

/// Lifecycle states of a computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputationState {
    /// Registered, waiting in the queue.
    Pending,
    /// Picked up by a worker.
    Started,
    /// Finished and recorded.
    Success,
    /// Failed and recorded.
    Failure,
    /// Scheduled for another attempt.
    Retry,
    /// Revoked while pending or in flight.
    Revoked,
}

impl ComputationState {
    /// Returns `true` for states no computation leaves again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }

    /// The set of states that may directly follow `self`.
    pub fn valid_transitions(&self) -> &'static [ComputationState] {
        match self {
            Self::Pending => &[Self::Started, Self::Retry, Self::Failure, Self::Revoked],
            Self::Started => &[Self::Success, Self::Failure, Self::Retry, Self::Revoked],
            Self::Retry => &[Self::Started, Self::Failure, Self::Revoked],
            Self::Success | Self::Failure | Self::Revoked => &[],
        }
    }

    /// Returns `true` if moving from `self` to `next` preserves the
    /// monotone lifecycle order.
    pub fn can_transition_to(&self, next: ComputationState) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Stable lower-case string form, identical to the serde encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Retry => "retry",
            Self::Revoked => "revoked",
        }
    }

    /// Parse the stable string form produced by [`Self::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "started" => Some(Self::Started),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "retry" => Some(Self::Retry),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Computation record
// ---------------------------------------------------------------------------

/// Reference to the plugin version that owns a computation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginRef {
    /// Plugin id.
    pub id: String,
    /// Plugin version.
    pub version: Version,
}

impl PluginRef {
    /// The plugin key: `"{id};{version}"`.
    pub fn key(&self) -> String {
        format!("{}{}{}", self.id, PLUGIN_KEY_SEPARATOR, self.version)
    }
}

/// The lifecycle record of one computation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputationInfo {
    /// Canonical identifier of the computation.
    pub correlation_uuid: Uuid,
    /// When the computation was first requested.
    pub request_ts: DateTime<Utc>,
    /// Content digest used for deduplication.
    pub deduplication_key: Uuid,
    /// Cache bucket index; `None` means not cacheable.
    pub cache_epoch: Option<i64>,
    /// Expiry of the cached result.
    pub valid_until: DateTime<Utc>,
    /// Validated parameters; absent until the worker accepted the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Raw parameters as requested by the client.
    pub requested_params: serde_json::Value,
    /// Target area of interest.
    pub aoi: AoiFeature,
    /// Artifacts produced, ordered by rank.
    #[serde(default)]
    pub artifacts: Vec<ArtifactEnriched>,
    /// The plugin version that owns this computation.
    pub plugin: PluginRef,
    /// Current lifecycle state, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ComputationState>,
    /// Message accompanying the outcome (e.g. a failure reason).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Artifact names that could not be computed, with error messages.
    #[serde(default)]
    pub artifact_errors: BTreeMap<String, String>,
    /// When the outcome was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_ts: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aoi::MultiPolygon;
    use proptest::prelude::*;
    use serde_json::json;

    // -- Shelf life serde ------------------------------------------------

    #[test]
    fn shelf_life_serde_forms() {
        assert_eq!(serde_json::to_string(&ShelfLife::Unbounded).unwrap(), "null");
        assert_eq!(serde_json::to_string(&ShelfLife::Seconds(60)).unwrap(), "60");
        assert_eq!(
            serde_json::from_str::<ShelfLife>("null").unwrap(),
            ShelfLife::Unbounded
        );
        assert_eq!(
            serde_json::from_str::<ShelfLife>("604800").unwrap(),
            ShelfLife::days(7)
        );
    }

    #[test]
    fn shelf_life_default_is_no_caching() {
        assert!(ShelfLife::default().is_zero());
    }

    // -- Cache slot ------------------------------------------------------

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn unbounded_caches_forever() {
        let slot = cache_slot(ts(1_000), ShelfLife::Unbounded);
        assert_eq!(slot.cache_epoch, Some(0));
        assert_eq!(slot.valid_until, far_future());
    }

    #[test]
    fn zero_shelf_life_never_caches() {
        let slot = cache_slot(ts(1_000), ShelfLife::Seconds(0));
        assert_eq!(slot.cache_epoch, None);
        assert_eq!(slot.valid_until, ts(1_000));
    }

    #[test]
    fn bounded_shelf_life_buckets_time() {
        let week = 7 * 86_400;
        let slot = cache_slot(ts(10 * week + 5), ShelfLife::days(7));
        assert_eq!(slot.cache_epoch, Some(10));
        assert_eq!(slot.valid_until, ts(11 * week));
    }

    #[test]
    fn bucket_boundary_starts_a_new_epoch() {
        let width = 3_600;
        let last_in = cache_slot(ts(width - 1), ShelfLife::Seconds(width as u64));
        let first_out = cache_slot(ts(width), ShelfLife::Seconds(width as u64));
        assert_eq!(last_in.cache_epoch, Some(0));
        assert_eq!(first_out.cache_epoch, Some(1));
    }

    proptest! {
        #[test]
        fn epoch_math_invariants(
            secs in 0i64..2_000_000_000,
            width in 1u64..10_000_000,
        ) {
            let slot = cache_slot(ts(secs), ShelfLife::Seconds(width));
            let epoch = slot.cache_epoch.unwrap();
            // The request falls inside its own bucket.
            prop_assert_eq!(epoch, secs.div_euclid(width as i64));
            prop_assert!(slot.valid_until > ts(secs));
            prop_assert_eq!(slot.valid_until.timestamp(), (epoch + 1) * width as i64);
        }
    }

    // -- Deduplication key -----------------------------------------------

    #[test]
    fn dedup_key_is_deterministic() {
        let params = json!({"b": 2, "a": 1});
        let wkt = MultiPolygon::bounding_box(0.0, 0.0, 1.0, 1.0).to_wkt();
        assert_eq!(
            deduplication_key(&params, &wkt),
            deduplication_key(&params, &wkt)
        );
    }

    #[test]
    fn dedup_key_ignores_object_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        let wkt = "MULTIPOLYGON EMPTY";
        assert_eq!(deduplication_key(&a, wkt), deduplication_key(&b, wkt));
    }

    #[test]
    fn dedup_key_differs_for_different_aoi() {
        let params = json!({"id": 1});
        let a = MultiPolygon::bounding_box(0.0, 0.0, 1.0, 1.0).to_wkt();
        let b = MultiPolygon::bounding_box(0.0, 0.0, 2.0, 2.0).to_wkt();
        assert_ne!(deduplication_key(&params, &a), deduplication_key(&params, &b));
    }

    // -- Lifecycle states ------------------------------------------------

    #[test]
    fn terminal_states_have_no_successors() {
        for state in [
            ComputationState::Success,
            ComputationState::Failure,
            ComputationState::Revoked,
        ] {
            assert!(state.is_terminal());
            assert!(state.valid_transitions().is_empty());
        }
    }

    #[test]
    fn pending_never_follows_success() {
        assert!(!ComputationState::Success.can_transition_to(ComputationState::Pending));
    }

    #[test]
    fn retry_allowed_from_pending_and_started() {
        assert!(ComputationState::Pending.can_transition_to(ComputationState::Retry));
        assert!(ComputationState::Started.can_transition_to(ComputationState::Retry));
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ComputationState::Started).unwrap(),
            "\"started\""
        );
    }
}
