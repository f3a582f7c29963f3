//! Index image builder
//!
//! An index image is a scratch image holding a catalog database at
//! [`INDEX_DB_PATH`]. Adding bundles pulls each bundle image, copies its
//! manifests and annotations out, inserts it into the database and then
//! recomputes the channel heads of every package it touched.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::catalog::{compute_package_manifest, Bundle, CatalogDatabase, CatalogError, ChannelMember};
use crate::container::{ContainerClient, ContainerError};
use crate::image::ImageReference;
use crate::manifest::{BundleAnnotations, ManifestDir, ManifestError, ANNOTATIONS_FILE};

pub const INDEX_DB_PATH: &str = "/database/index.db";
pub const INDEX_DOCKERFILE: &str = "index.Dockerfile";
pub const DATABASE_LABEL: &str = "operators.operatorframework.io.index.database.v1";
pub const DEFAULT_BINARY_SOURCE_IMAGE: &str = "quay.io/operator-framework/upstream-opm-builder";

/// Request to add bundles to an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBuildRequest {
    /// Write the Dockerfile and database instead of building
    pub generate: bool,
    /// Existing index to add to
    pub from_index: Option<ImageReference>,
    /// Image providing the opm binary; defaults to [`DEFAULT_BINARY_SOURCE_IMAGE`]
    pub binary_source_image: Option<String>,
    /// Dockerfile path in generate mode; defaults to [`INDEX_DOCKERFILE`]
    pub out_dockerfile: Option<PathBuf>,
    pub tag: ImageReference,
    /// Bundle images in insertion order
    pub bundles: Vec<ImageReference>,
    /// Skip bundles that fail to load instead of failing the request
    pub permissive: bool,
}

impl IndexBuildRequest {
    pub fn new(tag: ImageReference, bundles: Vec<ImageReference>) -> Self {
        Self {
            generate: false,
            from_index: None,
            binary_source_image: None,
            out_dockerfile: None,
            tag,
            bundles,
            permissive: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("no bundles to add")]
    NoBundles,

    #[error("invalid bundle {image}: {source}")]
    InvalidBundle {
        image: String,
        #[source]
        source: Box<IndexError>,
    },

    #[error("bundle {image} has no package annotation")]
    MissingPackage { image: String },

    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("index task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Adds bundle images to an index image
#[async_trait]
pub trait IndexAdder: Send + Sync {
    async fn add_to_index(&self, request: &IndexBuildRequest) -> Result<(), IndexError>;
}

/// `index.Dockerfile` content
pub fn index_dockerfile(binary_source_image: &str, database_dir: &str) -> String {
    let mut dockerfile = String::new();
    let _ = writeln!(dockerfile, "FROM {binary_source_image} AS builder");
    let _ = writeln!(dockerfile);
    let _ = writeln!(dockerfile, "FROM scratch");
    let _ = writeln!(dockerfile, "LABEL {DATABASE_LABEL}={INDEX_DB_PATH}");
    let _ = writeln!(dockerfile, "ADD {database_dir} /database");
    let _ = writeln!(dockerfile, "COPY --from=builder /bin/opm /bin/opm");
    let _ = writeln!(
        dockerfile,
        "COPY --from=builder /bin/grpc_health_probe /bin/grpc_health_probe"
    );
    let _ = writeln!(dockerfile, "EXPOSE 50051");
    let _ = writeln!(dockerfile, "ENTRYPOINT [\"/bin/opm\"]");
    let _ = writeln!(
        dockerfile,
        "CMD [\"registry\", \"serve\", \"--database\", \"{INDEX_DB_PATH}\"]"
    );
    dockerfile
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> IndexError + '_ {
    move |source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A bundle image whose content has been copied to disk
struct StagedBundle {
    image: ImageReference,
    dir: Result<PathBuf, IndexError>,
}

/// Builds index images with a container tool
pub struct ImageIndexAdder {
    client: Arc<dyn ContainerClient>,
}

impl ImageIndexAdder {
    pub fn new(client: Arc<dyn ContainerClient>) -> Self {
        Self { client }
    }

    /// Pull `image` and copy `/manifests` and `/metadata` into `dir`
    async fn stage_bundle(&self, image: &ImageReference, dir: &Path) -> Result<PathBuf, IndexError> {
        self.client.pull(image).await?;
        tokio::fs::create_dir_all(dir).await.map_err(io_error(dir))?;
        self.client
            .extract(image, "/manifests", &dir.join("manifests"))
            .await?;
        self.client
            .extract(image, "/metadata", &dir.join("metadata"))
            .await?;
        Ok(dir.to_path_buf())
    }

    /// Seed the database from an existing index
    async fn stage_from_index(&self, from: &ImageReference, db_path: &Path) -> Result<(), IndexError> {
        info!("Adding to existing index {}", from);
        self.client.pull(from).await?;
        self.client.extract(from, INDEX_DB_PATH, db_path).await?;
        Ok(())
    }

    async fn persist_generated(
        &self,
        request: &IndexBuildRequest,
        context: &Path,
        dockerfile: &str,
    ) -> Result<(), IndexError> {
        let out = request
            .out_dockerfile
            .clone()
            .unwrap_or_else(|| PathBuf::from(INDEX_DOCKERFILE));
        let out_dir = out
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let database_dir = out_dir.join("database");
        tokio::fs::create_dir_all(&database_dir)
            .await
            .map_err(io_error(&database_dir))?;
        let db_target = database_dir.join("index.db");
        tokio::fs::copy(context.join("database").join("index.db"), &db_target)
            .await
            .map_err(io_error(&db_target))?;
        tokio::fs::write(&out, dockerfile)
            .await
            .map_err(io_error(&out))?;
        info!(
            "Generated {} and {}",
            out.display(),
            db_target.display()
        );
        Ok(())
    }
}

#[async_trait]
impl IndexAdder for ImageIndexAdder {
    async fn add_to_index(&self, request: &IndexBuildRequest) -> Result<(), IndexError> {
        if request.bundles.is_empty() {
            return Err(IndexError::NoBundles);
        }

        let context = tempfile::Builder::new()
            .prefix("indexcheck-index-")
            .tempdir()
            .map_err(io_error(&std::env::temp_dir()))?;
        let scratch = TempDir::new().map_err(io_error(&std::env::temp_dir()))?;

        let database_dir = context.path().join("database");
        tokio::fs::create_dir_all(&database_dir)
            .await
            .map_err(io_error(&database_dir))?;
        let db_path = database_dir.join("index.db");

        if let Some(from) = &request.from_index {
            self.stage_from_index(from, &db_path).await?;
        }

        let mut staged = Vec::with_capacity(request.bundles.len());
        for (i, image) in request.bundles.iter().enumerate() {
            let dir = scratch.path().join(format!("bundle-{i}"));
            let dir = match self.stage_bundle(image, &dir).await {
                Err(e) if !request.permissive => return Err(invalid(image, e)),
                result => result,
            };
            staged.push(StagedBundle {
                image: image.clone(),
                dir,
            });
        }

        let added = {
            let permissive = request.permissive;
            tokio::task::spawn_blocking(move || populate_index(&db_path, staged, permissive))
                .await??
        };
        info!("Added {} bundle(s) to index database", added);

        let binary = request
            .binary_source_image
            .as_deref()
            .unwrap_or(DEFAULT_BINARY_SOURCE_IMAGE);
        let dockerfile = index_dockerfile(binary, "database");

        if request.generate {
            return self
                .persist_generated(request, context.path(), &dockerfile)
                .await;
        }

        let dockerfile_path = context.path().join(INDEX_DOCKERFILE);
        tokio::fs::write(&dockerfile_path, &dockerfile)
            .await
            .map_err(io_error(&dockerfile_path))?;
        self.client
            .build(&dockerfile_path, context.path(), &request.tag)
            .await?;
        info!("Built index image {}", request.tag);
        Ok(())
    }
}

fn invalid(image: &ImageReference, source: IndexError) -> IndexError {
    IndexError::InvalidBundle {
        image: image.to_string(),
        source: Box::new(source),
    }
}

/// Parse one staged bundle
fn read_staged(image: &ImageReference, dir: &Path) -> Result<(Bundle, BundleAnnotations), IndexError> {
    let manifests = ManifestDir::load(&dir.join("manifests"))?;
    let annotations = BundleAnnotations::from_file(&dir.join("metadata").join(ANNOTATIONS_FILE))?;
    let package = annotations
        .package()
        .ok_or_else(|| IndexError::MissingPackage {
            image: image.to_string(),
        })?
        .to_string();
    let bundle = Bundle::from_manifest_dir(&manifests)
        .with_package(package)
        .with_bundle_path(image.to_string());
    Ok((bundle, annotations))
}

#[derive(Default)]
struct PackageUpdate {
    members: Vec<ChannelMember>,
    default_channel: Option<String>,
}

/// Insert staged bundles and rebuild the channels of every touched package
fn populate_index(
    db_path: &Path,
    staged: Vec<StagedBundle>,
    permissive: bool,
) -> Result<usize, IndexError> {
    let mut db = CatalogDatabase::open(db_path)?;
    db.migrate()?;

    let mut updates: BTreeMap<String, PackageUpdate> = BTreeMap::new();
    let mut added = 0;

    for StagedBundle { image, dir } in staged {
        let loaded = dir
            .and_then(|dir| read_staged(&image, &dir))
            .and_then(|(bundle, annotations)| {
                let package = bundle.package_name.clone().unwrap_or_default();
                // Seed from what the database held before this bundle
                if !updates.contains_key(&package) {
                    let seeded = existing_members(&db, &package)?;
                    updates.insert(package.clone(), seeded);
                }
                db.add_bundle(&bundle)?;
                Ok((package, bundle, annotations))
            });

        let (package, bundle, annotations) = match loaded {
            Ok(loaded) => loaded,
            Err(e) if permissive => {
                warn!("Skipping bundle {}: {}", image, e);
                continue;
            }
            Err(e) => return Err(invalid(&image, e)),
        };

        let update = updates.entry(package).or_default();
        if let Some(default) = annotations.default_channel() {
            update.default_channel = Some(default.to_string());
        }
        update.members.push(ChannelMember {
            name: bundle.name.clone(),
            version: bundle.version.clone(),
            replaces: bundle.replaces.clone(),
            skips: bundle.skips.clone(),
            channels: annotations.channels(),
        });
        debug!("Inserted {} from {}", bundle.name, image);
        added += 1;
    }

    for (package, update) in updates {
        let manifest =
            compute_package_manifest(&package, &update.members, update.default_channel.as_deref())?;
        db.add_package_channels(&manifest)?;
        debug!(
            "Package {} heads: {:?}",
            package,
            manifest
                .channels
                .iter()
                .map(|c| format!("{}={}", c.name, c.current_csv))
                .collect::<Vec<_>>()
        );
    }

    Ok(added)
}

/// Members already in the database for `package`, for incremental adds
fn existing_members(db: &CatalogDatabase, package: &str) -> Result<PackageUpdate, IndexError> {
    let mut update = PackageUpdate::default();
    if let Some(existing) = db.get_package(package)? {
        update.default_channel = existing.default_channel;
    }
    for bundle in db.bundles_for_package(package)? {
        let channels = db.bundle_channels(&bundle.name)?;
        update.members.push(ChannelMember {
            name: bundle.name,
            version: bundle.version,
            replaces: bundle.replaces,
            skips: bundle.skips,
            channels,
        });
    }
    Ok(update)
}
