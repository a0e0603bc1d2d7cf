// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scoped ephemeral computation workspaces.
//!
//! Every task runs inside a fresh temporary directory keyed by its
//! correlation uuid. The directory is owned exclusively by the running
//! task and removed when the scope is dropped, on every path — success,
//! failure, or revocation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

/// Ephemeral resources handed to an operator for one computation.
#[derive(Debug)]
pub struct ComputationResources {
    /// The computation this scope belongs to.
    pub correlation_uuid: Uuid,
    /// Scratch directory; artifact files are produced here.
    pub computation_dir: PathBuf,
    /// Artifact name → reason, for artifacts that could not be
    /// produced. A non-empty map turns the computation into a partial
    /// success and invalidates its cache entry.
    pub artifact_errors: BTreeMap<String, String>,
}

/// Owns the temporary workspace of one computation.
pub struct ComputationScope {
    resources: ComputationResources,
    _temp: TempDir,
}

impl ComputationScope {
    /// Create a fresh workspace keyed by the correlation uuid.
    pub fn new(correlation_uuid: Uuid) -> std::io::Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix(&correlation_uuid.to_string())
            .tempdir()?;
        debug!(
            computation = %correlation_uuid,
            dir = %temp.path().display(),
            "computation scope created"
        );
        Ok(Self {
            resources: ComputationResources {
                correlation_uuid,
                computation_dir: temp.path().to_path_buf(),
                artifact_errors: BTreeMap::new(),
            },
            _temp: temp,
        })
    }

    /// The resources exposed to the operator.
    pub fn resources(&self) -> &ComputationResources {
        &self.resources
    }

    /// Mutable access for the operator to record artifact errors and
    /// write files.
    pub fn resources_mut(&mut self) -> &mut ComputationResources {
        &mut self.resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_exists_while_scoped_and_vanishes_after() {
        let scope = ComputationScope::new(Uuid::new_v4()).unwrap();
        let dir = scope.resources().computation_dir.clone();
        assert!(dir.is_dir());
        std::fs::write(dir.join("artifact.md"), b"# hi").unwrap();

        drop(scope);
        assert!(!dir.exists(), "scope exit removes the directory");
    }

    #[test]
    fn directory_is_keyed_by_correlation_uuid() {
        let uuid = Uuid::new_v4();
        let scope = ComputationScope::new(uuid).unwrap();
        let name = scope
            .resources()
            .computation_dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(name.starts_with(&uuid.to_string()));
    }

    #[test]
    fn scopes_do_not_share_directories() {
        let uuid = Uuid::new_v4();
        let a = ComputationScope::new(uuid).unwrap();
        let b = ComputationScope::new(uuid).unwrap();
        assert_ne!(
            a.resources().computation_dir,
            b.resources().computation_dir
        );
    }
}
