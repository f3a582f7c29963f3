//! Local catalog database
//!
//! A sqlite store of packages, channels and bundles. The index adder writes
//! one into every index image, the exporter reads it back out, and the
//! verifier loads an exported directory into a fresh one to prove the index
//! content is consumable.
//!
//! ```text
//! package ──< channel ──< channel_entry >── operatorbundle
//!              (head)      (replaces edges,     (csv + objects)
//!                           depth from head)
//! ```

mod database;
mod graph;
mod loader;
pub mod migrations;
mod summary;

pub use database::CatalogDatabase;
pub use graph::{compare_versions, compute_package_manifest, ChannelMember};
pub use loader::DirectoryLoader;
pub use summary::{BundleVersion, CatalogSummary, ChannelSummary, PackageSummary};

use serde_json::Value;
use std::path::PathBuf;

use crate::manifest::{ManifestDir, ManifestError};

/// Errors creating, migrating, populating or reading a catalog
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database schema version {found} is newer than the supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("failed to encode bundle {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("bundle {0} is already loaded")]
    DuplicateBundle(String),

    #[error("package {package} has no channels")]
    NoChannels { package: String },

    #[error("package {package} has no default channel")]
    MissingDefaultChannel { package: String },

    #[error("package {package}: default channel {channel} is not one of its channels")]
    UnknownDefaultChannel { package: String, channel: String },

    #[error("package {package}: head {head} of channel {channel} is not loaded")]
    MissingHead {
        package: String,
        channel: String,
        head: String,
    },

    #[error("invalid bundle {bundle}: replaces nonexistent bundle {replaces}")]
    MissingReplaces { bundle: String, replaces: String },

    #[error("package {package}: channel {channel} has a replaces cycle through {bundle}")]
    ReplacesCycle {
        package: String,
        channel: String,
        bundle: String,
    },

    #[error("invalid package manifest {}: {message}", .path.display())]
    PackageManifest { path: PathBuf, message: String },

    #[error("failed to walk {}: {message}", .path.display())]
    Walk { path: PathBuf, message: String },

    #[error("no bundles found under {}", .path.display())]
    NoBundles { path: PathBuf },

    #[error("scratch database {}: {source}", .path.display())]
    ScratchDatabase {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("round trip mismatch: {0}")]
    RoundTripMismatch(String),

    #[error("catalog task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One bundle row
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    /// CSV name
    pub name: String,
    pub package_name: Option<String>,
    pub version: String,
    pub replaces: Option<String>,
    pub skips: Vec<String>,
    pub skip_range: Option<String>,
    /// Image the bundle was loaded from, if any
    pub bundle_path: Option<String>,
    pub csv: Value,
    /// All objects of the bundle, CSV included
    pub objects: Vec<Value>,
}

impl Bundle {
    pub fn from_manifest_dir(dir: &ManifestDir) -> Self {
        let csv = &dir.csv;
        Self {
            name: csv.name().to_string(),
            package_name: None,
            version: csv.version().to_string(),
            replaces: csv.replaces().map(str::to_string),
            skips: csv.skips(),
            skip_range: csv.skip_range().map(str::to_string),
            bundle_path: None,
            csv: csv.as_value().clone(),
            objects: dir.objects.clone(),
        }
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package_name = Some(package.into());
        self
    }

    pub fn with_bundle_path(mut self, path: impl Into<String>) -> Self {
        self.bundle_path = Some(path.into());
        self
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Bundle;
    use serde_json::json;

    /// A bundle whose CSV carries `version`, `replaces` and `skips`
    pub fn bundle(name: &str, version: &str, replaces: Option<&str>, skips: &[&str]) -> Bundle {
        let csv = json!({
            "apiVersion": "operators.coreos.com/v1alpha1",
            "kind": "ClusterServiceVersion",
            "metadata": { "name": name },
            "spec": { "version": version, "replaces": replaces, "skips": skips },
        });
        let crd = json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": "prometheuses.monitoring.coreos.com" },
        });
        Bundle {
            name: name.to_string(),
            package_name: None,
            version: version.to_string(),
            replaces: replaces.map(str::to_string),
            skips: skips.iter().map(|s| s.to_string()).collect(),
            skip_range: None,
            bundle_path: None,
            csv: csv.clone(),
            objects: vec![csv, crd],
        }
    }
}
