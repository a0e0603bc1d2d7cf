// SPDX-License-Identifier: MIT OR Apache-2.0
//! Plugin descriptors.
//!
//! A [`PluginInfo`] is the immutable descriptor of one plugin version:
//! identity, ordered author list, version, parameter schema, demo
//! configuration, cache policy, and the library version the plugin was
//! built against. The primary key of an info row is
//! [`PluginInfo::key`]: `"{id};{version}"`.

use crate::aoi::MultiPolygon;
use crate::computation::ShelfLife;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Separator between plugin id and version in an info key.
pub const PLUGIN_KEY_SEPARATOR: char = ';';

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Topical tags that group plugins. A closed enumeration; extend here
/// when a new topic area is admitted to the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concern {
    /// Greenhouse-gas emission accounting.
    Emissions,
    /// Mitigation measures.
    Mitigation,
    /// Adaptation measures.
    Adaptation,
    /// Pedestrian mobility.
    Pedestrian,
    /// Cycling mobility.
    Cycling,
    /// Land use and land cover.
    LandUse,
    /// Waste management.
    Waste,
}

/// Development state of a plugin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Under active development; results may change without notice.
    Experimental,
    /// Maintained and recommended for use.
    Active,
    /// Kept running but not actively developed.
    Hibernate,
    /// No longer served.
    Archive,
}

// ---------------------------------------------------------------------------
// Authors
// ---------------------------------------------------------------------------

/// One plugin contributor. Author order within an info is meaningful
/// (research-paper order) and must round-trip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginAuthor {
    /// The author name; also the author's primary key in the store.
    pub name: String,
    /// Affiliation statement, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
    /// Website the author name links to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

impl PluginAuthor {
    /// An author with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            affiliation: None,
            website: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Fields shared by every bibliographic source entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCommon {
    /// Citation key.
    pub id: String,
    /// Title of the work.
    pub title: String,
    /// Author list as a single string.
    pub author: String,
    /// Year of publication.
    pub year: String,
    /// Free-form note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A bibliographic source, discriminated by `entry_type`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry_type", rename_all = "lowercase")]
pub enum Source {
    /// A journal article.
    Article {
        /// Shared fields.
        #[serde(flatten)]
        common: SourceCommon,
        /// Journal name.
        journal: String,
        /// Volume.
        volume: String,
        /// Issue number.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        number: Option<String>,
        /// Page range.
        pages: String,
        /// Link to the article.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// A book chapter.
    Inbook {
        /// Shared fields.
        #[serde(flatten)]
        common: SourceCommon,
        /// Book title.
        booktitle: String,
        /// Page range.
        pages: String,
        /// Link to the chapter.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// A conference contribution.
    Inproceedings {
        /// Shared fields.
        #[serde(flatten)]
        common: SourceCommon,
        /// Proceedings title.
        booktitle: String,
        /// Page range.
        pages: String,
        /// Link to the contribution.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// Anything else with a resolvable location.
    Misc {
        /// Shared fields.
        #[serde(flatten)]
        common: SourceCommon,
        /// Link to the resource; required for misc entries.
        url: String,
    },
}

impl Source {
    /// The shared fields of any variant.
    pub fn common(&self) -> &SourceCommon {
        match self {
            Self::Article { common, .. }
            | Self::Inbook { common, .. }
            | Self::Inproceedings { common, .. }
            | Self::Misc { common, .. } => common,
        }
    }

    /// The citation key.
    pub fn id(&self) -> &str {
        &self.common().id
    }
}

/// A citation key was requested that the sources library does not hold.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("the sources library does not contain a source with the id: {key}")]
pub struct UnknownSourceKey {
    /// The missing citation key.
    pub key: String,
}

/// Resolve citation keys against a sources library, preserving key
/// order. Fails on the first unknown key.
pub fn filter_sources(
    library: &BTreeMap<String, Source>,
    keys: impl IntoIterator<Item = impl AsRef<str>>,
) -> Result<Vec<Source>, UnknownSourceKey> {
    let mut out = Vec::new();
    for key in keys {
        let key = key.as_ref();
        match library.get(key) {
            Some(source) => out.push(source.clone()),
            None => {
                return Err(UnknownSourceKey {
                    key: key.to_string(),
                })
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Assets & demo configuration
// ---------------------------------------------------------------------------

/// Static data linked to a plugin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assets {
    /// The icon asset name.
    pub icon: String,
    /// All sources the plugin may cite, keyed by citation key.
    #[serde(default)]
    pub sources_library: BTreeMap<String, Source>,
}

impl Assets {
    /// Assets with an icon and an empty sources library.
    pub fn with_icon(icon: impl Into<String>) -> Self {
        Self {
            icon: icon.into(),
            sources_library: BTreeMap::new(),
        }
    }
}

/// Configuration to run a demonstration computation of a plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DemoConfig {
    /// The input parameters used for the demo.
    pub params: serde_json::Value,
    /// Display name of the demo AOI.
    pub name: String,
    /// The area of interest the demo runs in.
    pub aoi: MultiPolygon,
}

/// Compose a demo configuration from a typed parameter record and a
/// named AOI.
pub fn compose_demo_config<P: serde::Serialize>(
    params: &P,
    name: impl Into<String>,
    aoi: MultiPolygon,
) -> Result<DemoConfig, serde_json::Error> {
    Ok(DemoConfig {
        params: serde_json::to_value(params)?,
        name: name.into(),
        aoi,
    })
}

// ---------------------------------------------------------------------------
// PluginInfo
// ---------------------------------------------------------------------------

/// Immutable descriptor of one plugin version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Identifier derived from the display name (see [`derive_plugin_id`]).
    pub id: String,
    /// Plugin version.
    pub version: Version,
    /// Full display name.
    pub name: String,
    /// Contributors in research-paper order.
    pub authors: Vec<PluginAuthor>,
    /// Link to the plugin source code.
    pub repository: String,
    /// Development state.
    pub state: PluginState,
    /// Topical tags.
    pub concerns: BTreeSet<Concern>,
    /// Single-sentence teaser: 20–150 characters, starts upper-case,
    /// ends with a full stop.
    pub teaser: String,
    /// What the plugin accomplishes (markdown).
    pub purpose: String,
    /// How the plugin achieves its goal (markdown).
    pub methodology: String,
    /// Sources underlying the plugin as a whole; every entry must come
    /// from `assets.sources_library`.
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Demo computation configuration.
    pub demo_config: DemoConfig,
    /// Cache-bucket width for computations of this plugin.
    #[serde(default)]
    pub computation_shelf_life: ShelfLife,
    /// Static assets.
    pub assets: Assets,
    /// JSON schema of the operator parameter object; filled in by the
    /// worker host from the declared parameter type.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub operator_schema: serde_json::Value,
    /// The runtime contract version the plugin was built against.
    pub library_version: Version,
}

impl PluginInfo {
    /// The info primary key: `"{id};{version}"`.
    pub fn key(&self) -> String {
        format!("{}{}{}", self.id, PLUGIN_KEY_SEPARATOR, self.version)
    }

    /// Validate the descriptor, accumulating every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("name must not be empty".into());
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphabetic() || c == ' ' || c == '-')
        {
            errors.push(format!(
                "name may only contain letters, spaces, and hyphens: {:?}",
                self.name
            ));
        }

        if self.id != derive_plugin_id(&self.name) {
            errors.push(format!(
                "id {:?} does not match the id derived from the name ({:?})",
                self.id,
                derive_plugin_id(&self.name)
            ));
        }

        let teaser_chars = self.teaser.chars().count();
        if !(20..=150).contains(&teaser_chars) {
            errors.push(format!(
                "teaser must be between 20 and 150 characters long, got {teaser_chars}"
            ));
        }
        if !self.teaser.chars().next().is_some_and(|c| c.is_uppercase()) {
            errors.push("teaser must start with an upper-case letter".into());
        }
        if !self.teaser.ends_with('.') {
            errors.push("teaser must end with a full stop".into());
        }

        if self.authors.is_empty() {
            errors.push("at least one author is required".into());
        }

        for source in &self.sources {
            if !self.assets.sources_library.contains_key(source.id()) {
                errors.push(format!(
                    "info source {:?} is not part of the sources library",
                    source.id()
                ));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Derive the plugin id from the display name: lower-case, keep only
/// letters, hyphens, and whitespace, then replace whitespace runs'
/// characters with underscores. Idempotent and ASCII by construction.
pub fn derive_plugin_id(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphabetic() || *c == '-' || c.is_whitespace() || *c == '_')
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// The plugin id of a broker worker hostname (`plugin_id@host`).
pub fn extract_plugin_id(hostname: &str) -> &str {
    hostname.split('@').next().unwrap_or(hostname)
}
