// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core domain types and contracts for the Terraplane platform.
//!
//! This crate defines the data model shared by the sender, the stores,
//! the broker, the workers, and the gateway: plugin descriptors, areas
//! of interest, artifact descriptors, computation lifecycle records,
//! event frames, cache-epoch arithmetic, deduplication keys, and
//! library-version compatibility.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Areas of interest: GeoJSON feature types and the WKT writer.
pub mod aoi;
/// Artifact descriptors and filename sanitisation.
pub mod artifact;
/// Computation lifecycle records, cache-epoch math, deduplication keys.
pub mod computation;
/// Lifecycle event frames carried by the broker.
pub mod event;
/// Plugin descriptors: info, authors, sources, assets, demo config.
pub mod info;
/// Library-version compatibility rules.
pub mod version;

pub use aoi::{AoiFeature, AoiProperties, MultiPolygon, Position, DEMO_AOI_ID_PREFIX, SRID};
pub use artifact::{
    enrich_artifacts, sanitize_filename, Artifact, ArtifactEnriched, ArtifactModality, Attachments,
    Legend, COMPUTATION_INFO_FILENAME,
};
pub use computation::{
    cache_slot, deduplication_key, far_future, CacheOverride, CacheSlot, ComputationInfo,
    ComputationState, PluginRef, ShelfLife,
};
pub use event::{ComputeCommand, ComputeCommandResult, InfoCommand, NOTIFY_EXCHANGE};
pub use info::{
    compose_demo_config, derive_plugin_id, extract_plugin_id, filter_sources, Assets, Concern,
    DemoConfig, PluginAuthor, PluginInfo, PluginState, Source, SourceCommon, UnknownSourceKey,
};
pub use version::{is_compatible, latest_ordering};

/// The runtime contract version this library was built as.
///
/// Plugins record the library version they were built against; the
/// sender and the worker hosts refuse to talk across incompatible
/// versions (see [`version::is_compatible`]).
pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parse [`LIBRARY_VERSION`] into a [`semver::Version`].
pub fn library_version() -> semver::Version {
    // The cargo manifest version is valid semver by construction.
    semver::Version::parse(LIBRARY_VERSION).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_version_parses() {
        let v = library_version();
        assert_eq!(v.to_string(), LIBRARY_VERSION);
    }
}
