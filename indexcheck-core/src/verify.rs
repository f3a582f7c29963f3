//! Catalog verification
//!
//! Loads an exported directory into a fresh scratch database. A successful
//! load proves the exported content is consumable; comparing the resulting
//! summary with what was declared proves nothing was lost on the way.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::bundle::BundleSpec;
use crate::catalog::{
    compare_versions, CatalogDatabase, CatalogError, CatalogSummary, DirectoryLoader,
};
use crate::manifest::ManifestDir;

/// Loads an exported directory into a catalog
#[async_trait]
pub trait CatalogVerifier: Send + Sync {
    async fn verify(&self, exported_dir: &Path) -> Result<CatalogSummary, CatalogError>;
}

/// Verifies with a scratch `index_tmp*.db` file
///
/// The file is removed when verification returns, on success or failure,
/// unless it is kept for inspection.
#[derive(Debug, Clone)]
pub struct SqliteVerifier {
    db_dir: PathBuf,
    keep_database: bool,
}

impl SqliteVerifier {
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
            keep_database: false,
        }
    }

    pub fn keep_database(mut self, keep: bool) -> Self {
        self.keep_database = keep;
        self
    }

    fn load(&self, exported_dir: &Path) -> Result<CatalogSummary, CatalogError> {
        let scratch = tempfile::Builder::new()
            .prefix("index_tmp")
            .suffix(".db")
            .tempfile_in(&self.db_dir)
            .map_err(|source| CatalogError::ScratchDatabase {
                path: self.db_dir.clone(),
                source,
            })?;
        debug!("Scratch database {}", scratch.path().display());

        let summary = {
            let mut db = CatalogDatabase::open(scratch.path())?;
            db.migrate()?;
            DirectoryLoader::new(&mut db, exported_dir).populate()?;
            db.summary()?
        };

        if self.keep_database {
            let (_, path) = scratch.keep().map_err(|e| CatalogError::ScratchDatabase {
                path: e.file.path().to_path_buf(),
                source: e.error,
            })?;
            info!("Kept scratch database {}", path.display());
        }
        Ok(summary)
    }
}

#[async_trait]
impl CatalogVerifier for SqliteVerifier {
    async fn verify(&self, exported_dir: &Path) -> Result<CatalogSummary, CatalogError> {
        let verifier = self.clone();
        let exported_dir = exported_dir.to_path_buf();
        tokio::task::spawn_blocking(move || verifier.load(&exported_dir)).await?
    }
}

/// What a verified catalog must contain for the exported package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTripExpectation {
    pub package: String,
    /// Declared bundle versions per channel
    pub channels: BTreeMap<String, BTreeSet<String>>,
    pub default_channel: Option<String>,
}

impl RoundTripExpectation {
    /// Expectation for `package` built from the declared bundles
    ///
    /// Versions are read from the source CSVs, not from the directory names.
    pub fn from_specs(package: &str, specs: &[BundleSpec]) -> Result<Self, CatalogError> {
        let mut channels: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut default_channel = None;

        for spec in specs.iter().filter(|s| s.package_name == package) {
            let manifests = ManifestDir::load(&spec.path)?;
            let version = manifests.csv.version();
            for channel in &spec.channels {
                channels
                    .entry(channel.clone())
                    .or_default()
                    .insert(version.to_string());
            }
            if spec.default_channel.is_some() {
                default_channel = spec.default_channel.clone();
            }
        }
        if default_channel.is_none() && channels.len() == 1 {
            default_channel = channels.keys().next().cloned();
        }

        Ok(Self {
            package: package.to_string(),
            channels,
            default_channel,
        })
    }

    /// Every declared version across channels
    pub fn versions(&self) -> BTreeSet<String> {
        self.channels.values().flatten().cloned().collect()
    }

    pub fn check(&self, summary: &CatalogSummary) -> Result<(), CatalogError> {
        let mismatch = |msg: String| Err(CatalogError::RoundTripMismatch(msg));

        let Some(package) = summary.package(&self.package) else {
            return mismatch(format!("package {} was not loaded", self.package));
        };

        if self.default_channel.is_some() && package.default_channel != self.default_channel {
            return mismatch(format!(
                "default channel is {:?}, expected {:?}",
                package.default_channel, self.default_channel
            ));
        }

        for (name, expected) in &self.channels {
            let Some(channel) = package.channel(name) else {
                return mismatch(format!(
                    "channel {name} of package {} is missing",
                    self.package
                ));
            };

            let loaded: BTreeSet<String> =
                channel.bundles.iter().map(|b| b.version.clone()).collect();
            if &loaded != expected {
                return mismatch(format!(
                    "channel {name}: loaded versions {loaded:?} differ from declared versions {expected:?}"
                ));
            }

            let highest = expected.iter().max_by(|a, b| compare_versions(a, b));
            if channel.head_version() != highest.map(String::as_str) {
                return mismatch(format!(
                    "channel {name}: head is {} ({:?}), expected version {:?}",
                    channel.head,
                    channel.head_version(),
                    highest
                ));
            }
        }

        let loaded = package.versions();
        let declared = self.versions();
        if loaded != declared {
            return mismatch(format!(
                "loaded versions {loaded:?} differ from declared versions {declared:?}"
            ));
        }
        Ok(())
    }
}
