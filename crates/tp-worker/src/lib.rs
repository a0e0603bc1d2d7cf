// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker-side runtime for Terraplane plugins.
//!
//! A plugin is an [`Operator`] implementation hosted by
//! [`host::serve_plugin`]: the host derives the enriched plugin info
//! (parameter schema, library version), performs the startup version
//! checks, binds the broker queue, and drives one task at a time
//! through the [`runner::TaskRunner`] lifecycle inside a scoped
//! temporary workspace.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Plugin host startup, registration, and the serve loop.
pub mod host;
/// The operator contract and enriched-info construction.
pub mod operator;
/// The per-task lifecycle.
pub mod runner;
/// Scoped ephemeral computation workspaces.
pub mod scope;
/// Schema-driven parameter validation with readable messages.
pub mod validate;

pub use host::{serve_plugin, HostOptions, PluginWorker};
pub use operator::{enriched_info, operator_schema, Operator, OperatorError};
pub use runner::TaskRunner;
pub use scope::{ComputationResources, ComputationScope};
pub use validate::validate_params;
