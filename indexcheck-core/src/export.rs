//! Index exporter
//!
//! Reads one package back out of an index image into a directory:
//!
//! ```text
//! <download_path>/
//!   package.yaml                                  channels and heads
//!   <version>/
//!     <name>.clusterserviceversion.yaml           one file per object
//!     <name>.customresourcedefinition.yaml
//! ```
//!
//! A bundle whose version directory is already taken by another bundle of the
//! package is written under its CSV name instead.
//!
//! The download path always ends up holding this export only: a previous
//! export found there is removed first.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::catalog::{CatalogDatabase, CatalogError};
use crate::container::{ContainerClient, ContainerError, ContainerTool};
use crate::image::ImageReference;
use crate::index::INDEX_DB_PATH;
use crate::manifest::{object_kind, object_name};

pub const PACKAGE_FILE: &str = "package.yaml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub index: ImageReference,
    pub package: String,
    /// Created if missing, replaced if it holds a previous export
    pub download_path: PathBuf,
    pub container_tool: ContainerTool,
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("package {package} not found in index {index}")]
    PackageNotFound { package: String, index: String },

    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize {name}: {source}")]
    Serialize {
        name: String,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("refusing to export into {}: directory is not empty and holds no previous export", .path.display())]
    DirectoryNotEmpty { path: PathBuf },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("export task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Exports a package from an index image
#[async_trait]
pub trait IndexExporter: Send + Sync {
    async fn export(&self, request: &ExportRequest) -> Result<(), ExportError>;
}

pub struct ImageIndexExporter {
    client: Arc<dyn ContainerClient>,
}

impl ImageIndexExporter {
    pub fn new(client: Arc<dyn ContainerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IndexExporter for ImageIndexExporter {
    async fn export(&self, request: &ExportRequest) -> Result<(), ExportError> {
        debug!(
            "Exporting {} from {} with {}",
            request.package, request.index, request.container_tool
        );
        self.client.pull(&request.index).await?;

        let scratch = tempfile::Builder::new()
            .prefix("indexcheck-export-")
            .tempdir()
            .map_err(|source| ExportError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        let db_path = scratch.path().join("index.db");
        self.client
            .extract(&request.index, INDEX_DB_PATH, &db_path)
            .await?;

        let written = {
            let request = request.clone();
            tokio::task::spawn_blocking(move || write_package(&db_path, &request)).await??
        };
        info!(
            "Exported {} bundle(s) of {} to {}",
            written,
            request.package,
            request.download_path.display()
        );
        Ok(())
    }
}

/// File name for one exported object
pub fn object_file_name(object: &serde_json::Value, fallback: usize) -> String {
    let kind = object_kind(object).unwrap_or("object").to_lowercase();
    match object_name(object) {
        Some(name) => format!("{name}.{kind}.yaml"),
        None => format!("{kind}-{fallback}.yaml"),
    }
}

fn write(path: &Path, content: &str) -> Result<(), ExportError> {
    std::fs::write(path, content).map_err(io_error(path))
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn create_dir(path: &Path) -> Result<(), ExportError> {
    std::fs::create_dir_all(path).map_err(io_error(path))
}

/// Leave `path` as an empty directory
///
/// A previous export (a directory with a top-level `package.yaml`) is
/// removed. Any other non-empty directory is rejected and left untouched.
pub fn prepare_download_dir(path: &Path) -> Result<(), ExportError> {
    if path.join(PACKAGE_FILE).is_file() {
        debug!("Removing previous export in {}", path.display());
        std::fs::remove_dir_all(path).map_err(io_error(path))?;
    } else if path.exists() {
        let mut entries = std::fs::read_dir(path).map_err(io_error(path))?;
        if entries.next().is_some() {
            return Err(ExportError::DirectoryNotEmpty {
                path: path.to_path_buf(),
            });
        }
    }
    create_dir(path)
}

/// [`prepare_download_dir`] off the async runtime
pub async fn reset_download_dir(path: &Path) -> Result<(), ExportError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || prepare_download_dir(&path)).await?
}

/// Write the package manifest and every bundle of the package
fn write_package(db_path: &Path, request: &ExportRequest) -> Result<usize, ExportError> {
    let mut db = CatalogDatabase::open(db_path)?;
    db.migrate()?;

    let package = db
        .get_package(&request.package)?
        .ok_or_else(|| ExportError::PackageNotFound {
            package: request.package.clone(),
            index: request.index.to_string(),
        })?;

    prepare_download_dir(&request.download_path)?;
    let yaml = package.to_yaml().map_err(|source| ExportError::Serialize {
        name: PACKAGE_FILE.to_string(),
        source,
    })?;
    write(&request.download_path.join(PACKAGE_FILE), &yaml)?;

    let bundles = db.bundles_for_package(&request.package)?;
    let mut used = HashSet::new();
    for bundle in &bundles {
        // Bundle names are unique in a catalog, versions are not
        let dir_name = if bundle.version.is_empty() || !used.insert(bundle.version.as_str()) {
            bundle.name.as_str()
        } else {
            bundle.version.as_str()
        };
        let bundle_dir = request.download_path.join(dir_name);
        create_dir(&bundle_dir)?;

        for (i, object) in bundle.objects.iter().enumerate() {
            let yaml = serde_yaml_ng::to_string(object).map_err(|source| ExportError::Serialize {
                name: bundle.name.clone(),
                source,
            })?;
            write(&bundle_dir.join(object_file_name(object, i)), &yaml)?;
        }
        debug!("Wrote {} object(s) of {}", bundle.objects.len(), bundle.name);
    }

    Ok(bundles.len())
}
