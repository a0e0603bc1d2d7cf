// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact descriptors.
//!
//! An artifact is a file with typed metadata produced by a computation.
//! Operators return plain [`Artifact`] descriptors; the worker enriches
//! them with the owning correlation uuid, their rank (insertion order),
//! and resolved bibliographic sources before anything is persisted.

use crate::info::{filter_sources, Source, UnknownSourceKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Filename of the computation-info artifact persisted at the end of
/// every successful computation.
pub const COMPUTATION_INFO_FILENAME: &str = "metadata.json";

// ---------------------------------------------------------------------------
// Modality
// ---------------------------------------------------------------------------

/// The kind of content an artifact file holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactModality {
    /// Markdown text.
    Markdown,
    /// Tabular data.
    Table,
    /// A static image.
    Image,
    /// A chart specification.
    Chart,
    /// A raster map layer.
    Raster,
    /// A vector map layer.
    Vector,
    /// The computation-info metadata document.
    ComputationInfo,
}

// ---------------------------------------------------------------------------
// Legend & attachments
// ---------------------------------------------------------------------------

/// Legend attached to a map-layer artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "legend_type", rename_all = "snake_case")]
pub enum Legend {
    /// Distinct labelled colors.
    Discrete {
        /// Custom legend title; the artifact name is used when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Label → hex color.
        entries: BTreeMap<String, String>,
    },
    /// A continuous color ramp.
    Continuous {
        /// Custom legend title; the artifact name is used when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// Colormap name the colors were picked from.
        cmap_name: String,
        /// Tick label → position on the ramp in `[0, 1]`.
        ticks: BTreeMap<String, f64>,
    },
}

/// Additional information or files linked to an artifact.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachments {
    /// The legend attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legend: Option<Legend>,
    /// Name of a sibling file optimised for front-end display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_filename: Option<String>,
}

impl Attachments {
    /// Returns `true` if no attachment is present.
    pub fn is_empty(&self) -> bool {
        self.legend.is_none() && self.display_filename.is_none()
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// A result descriptor as returned by an operator.
///
/// `filename` names the file inside the computation directory, without
/// an extension; the effective stored name keeps whatever extension the
/// file on disk carries. `sources` holds citation keys into the
/// plugin's sources library.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Short name, usable as an alias.
    pub name: String,
    /// Content kind.
    pub modality: ArtifactModality,
    /// Whether this is a primary artifact (as opposed to contextual
    /// information).
    #[serde(default = "default_primary")]
    pub primary: bool,
    /// Tags grouping artifacts semantically.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Short description usable as a caption.
    pub summary: String,
    /// Long description helping users understand the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// File name within the computation directory, extensionless.
    pub filename: String,
    /// Linked attachments.
    #[serde(default, skip_serializing_if = "Attachments::is_empty")]
    pub attachments: Attachments,
    /// Citation keys into the plugin's sources library.
    #[serde(default)]
    pub sources: BTreeSet<String>,
}

fn default_primary() -> bool {
    true
}

impl Artifact {
    /// Validate the descriptor, accumulating every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("artifact name must not be empty".into());
        }
        if self.summary.is_empty() {
            errors.push("artifact summary must not be empty".into());
        }
        if self.filename.is_empty() {
            errors.push("artifact filename must not be empty".into());
        }
        if !self.filename.is_ascii() {
            errors.push(format!(
                "artifact filename must be ASCII: {:?}",
                self.filename
            ));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Sanitise a filename deterministically: whitespace becomes `_`,
/// ASCII letters, digits, `.`, `_`, and `-` pass through, everything
/// else is dropped. The result survives an ASCII round-trip.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some('_')
            } else if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                Some(c)
            } else {
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// ArtifactEnriched
// ---------------------------------------------------------------------------

/// An artifact descriptor bound to its computation.
///
/// Rank is the insertion order within the computation and strictly
/// increases; sources are resolved entries, not citation keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEnriched {
    /// The computation that produced this artifact.
    pub correlation_uuid: Uuid,
    /// Order within the computation.
    pub rank: u32,
    /// Short name, usable as an alias.
    pub name: String,
    /// Content kind.
    pub modality: ArtifactModality,
    /// Whether this is a primary artifact.
    pub primary: bool,
    /// Tags grouping artifacts semantically.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Short description usable as a caption.
    pub summary: String,
    /// Long description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Sanitised file name.
    pub filename: String,
    /// Linked attachments.
    #[serde(default, skip_serializing_if = "Attachments::is_empty")]
    pub attachments: Attachments,
    /// Resolved sources backing this artifact.
    #[serde(default)]
    pub sources: Vec<Source>,
}

impl ArtifactEnriched {
    /// The descriptor of the final computation-info artifact, ranked
    /// after every operator artifact.
    pub fn computation_info(correlation_uuid: Uuid, rank: u32) -> Self {
        Self {
            correlation_uuid,
            rank,
            name: "Computation Info".into(),
            modality: ArtifactModality::ComputationInfo,
            primary: false,
            tags: BTreeSet::new(),
            summary: format!("Computation information of correlation_uuid {correlation_uuid}"),
            description: None,
            filename: COMPUTATION_INFO_FILENAME.into(),
            attachments: Attachments::default(),
            sources: Vec::new(),
        }
    }
}

/// Bind operator artifacts to a computation: assign ranks by insertion
/// order, sanitise filenames, and resolve citation keys against the
/// plugin's sources library.
pub fn enrich_artifacts(
    artifacts: Vec<Artifact>,
    correlation_uuid: Uuid,
    sources_library: &BTreeMap<String, Source>,
) -> Result<Vec<ArtifactEnriched>, UnknownSourceKey> {
    artifacts
        .into_iter()
        .enumerate()
        .map(|(rank, artifact)| {
            let sources = filter_sources(sources_library, artifact.sources.iter())?;
            Ok(ArtifactEnriched {
                correlation_uuid,
                rank: rank as u32,
                name: artifact.name,
                modality: artifact.modality,
                primary: artifact.primary,
                tags: artifact.tags,
                summary: artifact.summary,
                description: artifact.description,
                filename: sanitize_filename(&artifact.filename),
                attachments: artifact.attachments,
                sources,
            })
        })
        .collect()
}
