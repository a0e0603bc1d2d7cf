// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for the Terraplane
//! platform.
//!
//! Every platform error carries an [`ErrorCode`] (a machine-readable,
//! stable string tag), a human-readable message, an optional cause, and
//! arbitrary key-value context. The code determines how the rest of the
//! platform reacts to a failure — most importantly whether a failed
//! computation is cached to suppress retries with identical bad input.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// User-supplied parameters failed validation.
    Validation,
    /// Plugin discovery, registration, or version negotiation errors.
    Plugin,
    /// Relational- or object-store errors.
    Store,
    /// Errors raised by an operator on behalf of the user.
    Operator,
    /// External utility errors.
    Utility,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Plugin => "plugin",
            Self::Store => "store",
            Self::Operator => "operator",
            Self::Utility => "utility",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The user's parameters do not satisfy the plugin's schema.
    ///
    /// Fatal for the computation; the failure is cached permanently so
    /// identical bad input is never re-run.
    InputValidation,
    /// Plugin library version incompatible with the local runtime.
    VersionMismatch,
    /// No plugin with the requested id is known, or it did not respond
    /// within the request TTL.
    InfoNotReceived,
    /// A non-recoverable error chosen by the plugin as user-visible; the
    /// message is propagated verbatim.
    OperatorUser,
    /// An external utility was unreachable or returned an error status.
    Utility,
    /// The database schema does not satisfy the startup assertion.
    SchemaMismatch,
    /// A relational- or object-store operation failed.
    Storage,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InputValidation => ErrorCategory::Validation,
            Self::VersionMismatch | Self::InfoNotReceived => ErrorCategory::Plugin,
            Self::SchemaMismatch | Self::Storage => ErrorCategory::Store,
            Self::OperatorUser => ErrorCategory::Operator,
            Self::Utility => ErrorCategory::Utility,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"INPUT_VALIDATION"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputValidation => "INPUT_VALIDATION",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::InfoNotReceived => "INFO_NOT_RECEIVED",
            Self::OperatorUser => "OPERATOR_USER",
            Self::Utility => "UTILITY",
            Self::SchemaMismatch => "SCHEMA_MISMATCH",
            Self::Storage => "STORAGE",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether a computation failing with this code is cached forever so
    /// that identical requests return the recorded failure instead of
    /// re-running.
    pub fn caches_failure(&self) -> bool {
        matches!(self, Self::InputValidation)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PlatformError
// ---------------------------------------------------------------------------

/// Unified platform error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use tp_error::{ErrorCode, PlatformError};
///
/// let err = PlatformError::new(ErrorCode::InfoNotReceived, "no plugin named 'oracle'")
///     .with_context("plugin_id", "oracle")
///     .with_context("ttl_secs", 3);
/// ```
pub struct PlatformError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl PlatformError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Shorthand for an [`ErrorCode::InputValidation`] error.
    pub fn input_validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InputValidation, message)
    }

    /// Shorthand for an [`ErrorCode::VersionMismatch`] error.
    pub fn version_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::VersionMismatch, message)
    }

    /// Shorthand for an [`ErrorCode::InfoNotReceived`] error.
    pub fn info_not_received(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InfoNotReceived, message)
    }

    /// Shorthand for an [`ErrorCode::Storage`] error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Storage, message)
    }

    /// Shorthand for an [`ErrorCode::Internal`] error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Whether this failure is cached forever (see
    /// [`ErrorCode::caches_failure`]).
    pub fn caches_failure(&self) -> bool {
        self.code.caches_failure()
    }
}

impl fmt::Debug for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("PlatformError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            // The operator chose this message for the user; show it bare.
            ErrorCode::OperatorUser => f.write_str(&self.message),
            _ => write!(f, "[{}] {}", self.code.as_str(), self.message),
        }
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`PlatformError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&PlatformError> for PlatformErrorDto {
    fn from(err: &PlatformError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<PlatformErrorDto> for PlatformError {
    fn from(dto: PlatformErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
