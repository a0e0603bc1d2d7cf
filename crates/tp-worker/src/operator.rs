// SPDX-License-Identifier: MIT OR Apache-2.0
//! The operator contract.
//!
//! An operator declares a typed parameter record; the host generates
//! its JSON schema at startup and ships it inside the plugin info so
//! the platform can validate requests before they reach the operator.
//! The parameter type must not name the reserved fields `aoi` and
//! `aoi_properties` — those travel next to the params, not inside them.

use crate::scope::ComputationResources;
use async_trait::async_trait;
use schemars::{JsonSchema, SchemaGenerator};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tp_core::{derive_plugin_id, library_version, AoiProperties, Artifact, MultiPolygon, PluginInfo};
use tp_error::PlatformError;

/// Parameter fields reserved by the platform.
pub const RESERVED_PARAM_FIELDS: &[&str] = &["aoi", "aoi_properties"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors an operator may raise from its compute procedure.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// A non-recoverable condition the user must know about; the
    /// message is forwarded verbatim.
    #[error("{0}")]
    User(String),

    /// Anything else that broke inside the operator.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<OperatorError> for PlatformError {
    fn from(err: OperatorError) -> Self {
        match err {
            OperatorError::User(message) => {
                PlatformError::new(tp_error::ErrorCode::OperatorUser, message)
            }
            OperatorError::Internal(source) => {
                PlatformError::internal(format!("{source:#}"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Operator trait
// ---------------------------------------------------------------------------

/// Domain-specific computation logic of one plugin.
///
/// Each plugin implements exactly one operator; everything else (queue
/// handling, validation, persistence) is provided by the host.
#[async_trait]
pub trait Operator: Send + Sync + 'static {
    /// The typed parameter record of this operator. Its generated JSON
    /// schema becomes the plugin's `operator_schema`.
    type Params: DeserializeOwned + Serialize + JsonSchema + Send;

    /// Describe the plugin: purpose, methodology, authors, sources.
    ///
    /// `operator_schema`, `library_version`, and `id` are overwritten by
    /// the host; whatever the implementation fills in there is ignored.
    fn info(&self) -> PluginInfo;

    /// Run the computation over the AOI and validated parameters.
    ///
    /// Artifact slots may be `None` when a single artifact could not be
    /// produced; record the reason in
    /// [`ComputationResources::artifact_errors`] so the platform can
    /// invalidate the cache and report the partial result.
    async fn compute(
        &self,
        resources: &mut ComputationResources,
        aoi: &MultiPolygon,
        aoi_properties: &AoiProperties,
        params: Self::Params,
    ) -> Result<Vec<Option<Artifact>>, OperatorError>;
}

// ---------------------------------------------------------------------------
// Enriched info
// ---------------------------------------------------------------------------

/// Generate the JSON schema of an operator's parameter type.
pub fn operator_schema<O: Operator>() -> Result<serde_json::Value, PlatformError> {
    let schema = SchemaGenerator::default().into_root_schema_for::<O::Params>();
    serde_json::to_value(&schema)
        .map_err(|e| PlatformError::internal(format!("operator schema is not valid JSON: {e}")))
}

/// Build the effective plugin info: the operator's user-supplied info
/// with the generated parameter schema, the local library version, and
/// the derived id merged in. Validates the result and rejects reserved
/// parameter fields.
pub fn enriched_info<O: Operator>(operator: &O) -> Result<PluginInfo, PlatformError> {
    let schema = operator_schema::<O>()?;

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for reserved in RESERVED_PARAM_FIELDS {
            if properties.contains_key(*reserved) {
                return Err(PlatformError::internal(format!(
                    "the plugin input parameters cannot contain a field named {reserved:?}"
                )));
            }
        }
    }

    let mut info = operator.info();
    info.id = derive_plugin_id(&info.name);
    info.operator_schema = schema;
    info.library_version = library_version();

    if let Err(reasons) = info.validate() {
        return Err(PlatformError::internal(format!(
            "plugin info for {} is invalid: {}",
            info.name,
            reasons.join("; ")
        )));
    }
    Ok(info)
}
