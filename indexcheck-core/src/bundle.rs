//! Bundle image builder
//!
//! A bundle image is a scratch image carrying one operator version: the
//! manifest directory at `/manifests/` and the bundle annotations at
//! `/metadata/annotations.yaml`. The same annotations are repeated as image
//! labels so a registry can be queried without pulling the content.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::container::{ContainerClient, ContainerError};
use crate::image::ImageReference;
use crate::manifest::{self, BundleAnnotations, ManifestDir, ManifestError, ANNOTATIONS_FILE};

pub const BUNDLE_DOCKERFILE: &str = "bundle.Dockerfile";

/// One bundle version declared for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSpec {
    pub path: PathBuf,
    pub package_name: String,
    pub channels: Vec<String>,
    pub default_channel: Option<String>,
}

impl BundleSpec {
    /// Request to build this bundle as `image`
    pub fn build_request(&self, image: ImageReference) -> BundleBuildRequest {
        BundleBuildRequest {
            path: self.path.clone(),
            image,
            package_name: self.package_name.clone(),
            channels: self.channels.clone(),
            default_channel: self.default_channel.clone(),
            generate_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleBuildRequest {
    /// Manifest directory of the bundle
    pub path: PathBuf,
    pub image: ImageReference,
    pub package_name: String,
    pub channels: Vec<String>,
    pub default_channel: Option<String>,
    /// Write annotations and Dockerfile beside `path` without building
    pub generate_only: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("invalid channels: {0}")]
    Channels(String),

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize annotations: {0}")]
    Annotations(#[from] serde_yaml_ng::Error),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// Builds bundle images from manifest directories
#[async_trait]
pub trait BundleBuilder: Send + Sync {
    async fn build(&self, request: &BundleBuildRequest) -> Result<(), BundleError>;
}

/// Resolve the default channel: explicit, or the only declared channel
fn resolve_default_channel(
    channels: &[String],
    default_channel: Option<&str>,
) -> Result<Option<String>, BundleError> {
    if channels.is_empty() {
        return Err(BundleError::Channels("no channels declared".to_string()));
    }
    match default_channel {
        Some(default) if !channels.iter().any(|c| c == default) => Err(BundleError::Channels(
            format!("default channel {default} is not one of {channels:?}"),
        )),
        Some(default) => Ok(Some(default.to_string())),
        None if channels.len() == 1 => Ok(Some(channels[0].clone())),
        None => Ok(None),
    }
}

/// Annotations for a request, after validating its channels
pub fn annotations_for(request: &BundleBuildRequest) -> Result<BundleAnnotations, BundleError> {
    let default_channel =
        resolve_default_channel(&request.channels, request.default_channel.as_deref())?;
    Ok(BundleAnnotations::registry_v1(
        &request.package_name,
        &request.channels,
        default_channel.as_deref(),
    ))
}

/// `bundle.Dockerfile` content
pub fn bundle_dockerfile(annotations: &BundleAnnotations, manifests: &str, metadata: &str) -> String {
    let mut dockerfile = String::from("FROM scratch\n\n");
    for (key, value) in &annotations.annotations {
        let _ = writeln!(dockerfile, "LABEL {key}={value}");
    }
    let _ = write!(
        dockerfile,
        "\nCOPY {manifests} /{}\nCOPY {metadata} /{}\n",
        manifest::MANIFESTS_DIR,
        manifest::METADATA_DIR
    );
    dockerfile
}

async fn write_file(path: &Path, content: &str) -> Result<(), BundleError> {
    tokio::fs::write(path, content)
        .await
        .map_err(|source| BundleError::Write {
            path: path.to_path_buf(),
            source,
        })
}

async fn create_dir(path: &Path) -> Result<(), BundleError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| BundleError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Builds bundles with a container tool
pub struct ImageBundleBuilder {
    client: Arc<dyn ContainerClient>,
}

impl ImageBundleBuilder {
    pub fn new(client: Arc<dyn ContainerClient>) -> Self {
        Self { client }
    }

    /// Write `metadata/annotations.yaml` and `bundle.Dockerfile` beside the manifests
    async fn generate(
        &self,
        request: &BundleBuildRequest,
        annotations: &BundleAnnotations,
    ) -> Result<(), BundleError> {
        let parent = request
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let manifests_name = request
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "manifests".to_string());

        let metadata_dir = parent.join("metadata");
        create_dir(&metadata_dir).await?;
        write_file(&metadata_dir.join(ANNOTATIONS_FILE), &annotations.to_yaml()?).await?;

        let dockerfile = bundle_dockerfile(annotations, &format!("{manifests_name}/"), "metadata/");
        write_file(&parent.join(BUNDLE_DOCKERFILE), &dockerfile).await?;
        info!("Generated bundle metadata in {}", parent.display());
        Ok(())
    }

    /// Assemble a scratch context and build it
    async fn build_image(
        &self,
        request: &BundleBuildRequest,
        manifests: &ManifestDir,
        annotations: &BundleAnnotations,
    ) -> Result<(), BundleError> {
        let context = tempfile::Builder::new()
            .prefix("indexcheck-bundle-")
            .tempdir()
            .map_err(|source| BundleError::Write {
                path: std::env::temp_dir(),
                source,
            })?;

        let manifests_out = context.path().join("manifests");
        create_dir(&manifests_out).await?;
        let mut entries = tokio::fs::read_dir(&manifests.path)
            .await
            .map_err(|source| ManifestError::Read {
                path: manifests.path.clone(),
                source,
            })?;
        while let Some(entry) = entries.next_entry().await.map_err(|source| ManifestError::Read {
            path: manifests.path.clone(),
            source,
        })? {
            let source_path = entry.path();
            if !source_path.is_file() || !manifest::is_manifest_file(&source_path) {
                continue;
            }
            let target = manifests_out.join(entry.file_name());
            tokio::fs::copy(&source_path, &target)
                .await
                .map_err(|source| BundleError::Write {
                    path: target.clone(),
                    source,
                })?;
        }

        let metadata_out = context.path().join("metadata");
        create_dir(&metadata_out).await?;
        write_file(&metadata_out.join(ANNOTATIONS_FILE), &annotations.to_yaml()?).await?;

        let dockerfile_path = context.path().join(BUNDLE_DOCKERFILE);
        write_file(
            &dockerfile_path,
            &bundle_dockerfile(annotations, "manifests/", "metadata/"),
        )
        .await?;

        debug!("Bundle context for {} at {}", request.image, context.path().display());
        self.client
            .build(&dockerfile_path, context.path(), &request.image)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BundleBuilder for ImageBundleBuilder {
    async fn build(&self, request: &BundleBuildRequest) -> Result<(), BundleError> {
        let manifests = ManifestDir::load(&request.path)?;
        let annotations = annotations_for(request)?;
        debug!(
            "Bundle {} ({}) for package {}",
            manifests.csv.name(),
            manifests.csv.version(),
            request.package_name
        );

        if request.generate_only {
            return self.generate(request, &annotations).await;
        }
        self.build_image(request, &manifests, &annotations).await?;
        info!("Built bundle image {}", request.image);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Credentials;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const CSV: &str = "apiVersion: operators.coreos.com/v1alpha1\nkind: ClusterServiceVersion\nmetadata:\n  name: widget.v1.0.0\nspec:\n  version: 1.0.0\n";

    /// Snapshot of one build call, taken while the context still exists
    #[derive(Debug, Clone)]
    struct BuildCall {
        image: String,
        dockerfile: String,
        files: Vec<String>,
    }

    #[derive(Default)]
    struct RecordingClient {
        builds: Mutex<Vec<BuildCall>>,
    }

    #[async_trait]
    impl ContainerClient for RecordingClient {
        async fn login(&self, _: &str, _: &Credentials) -> Result<(), ContainerError> {
            Ok(())
        }
        async fn build(
            &self,
            dockerfile: &Path,
            context: &Path,
            image: &ImageReference,
        ) -> Result<(), ContainerError> {
            let mut files: Vec<String> = walkdir::WalkDir::new(context)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| {
                    e.path()
                        .strip_prefix(context)
                        .unwrap()
                        .to_string_lossy()
                        .replace('\\', "/")
                })
                .collect();
            files.sort();
            self.builds.lock().unwrap().push(BuildCall {
                image: image.to_string(),
                dockerfile: std::fs::read_to_string(dockerfile)?,
                files,
            });
            Ok(())
        }
        async fn push(&self, _: &ImageReference) -> Result<(), ContainerError> {
            Ok(())
        }
        async fn pull(&self, _: &ImageReference) -> Result<(), ContainerError> {
            Ok(())
        }
        async fn extract(&self, _: &ImageReference, _: &str, _: &Path) -> Result<(), ContainerError> {
            Ok(())
        }
    }

    fn bundle_dir() -> TempDir {
        let root = TempDir::new().unwrap();
        let manifests = root.path().join("1.0.0");
        std::fs::create_dir(&manifests).unwrap();
        std::fs::write(manifests.join("widget.clusterserviceversion.yaml"), CSV).unwrap();
        std::fs::write(manifests.join("README.md"), "not a manifest").unwrap();
        root
    }

    fn request(path: PathBuf, generate_only: bool) -> BundleBuildRequest {
        BundleBuildRequest {
            path,
            image: ImageReference::new("quay.io/olmtest/e2e-bundle", "abc123"),
            package_name: "widget".to_string(),
            channels: vec!["preview".to_string()],
            default_channel: None,
            generate_only,
        }
    }

    #[tokio::test]
    async fn test_build_assembles_context() {
        let root = bundle_dir();
        let client = Arc::new(RecordingClient::default());
        let builder = ImageBundleBuilder::new(client.clone());

        builder
            .build(&request(root.path().join("1.0.0"), false))
            .await
            .unwrap();

        let builds = client.builds.lock().unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].image, "quay.io/olmtest/e2e-bundle:abc123");
        assert_eq!(
            builds[0].files,
            vec![
                "bundle.Dockerfile",
                "manifests/widget.clusterserviceversion.yaml",
                "metadata/annotations.yaml"
            ]
        );
        let dockerfile = &builds[0].dockerfile;
        assert!(dockerfile.starts_with("FROM scratch"));
        assert!(dockerfile.contains("LABEL operators.operatorframework.io.bundle.package.v1=widget"));
        assert!(dockerfile
            .contains("LABEL operators.operatorframework.io.bundle.channel.default.v1=preview"));
        assert!(dockerfile.contains("COPY manifests/ /manifests/"));
    }

    #[tokio::test]
    async fn test_generate_only_writes_beside_manifests() {
        let root = bundle_dir();
        let client = Arc::new(RecordingClient::default());
        let builder = ImageBundleBuilder::new(client.clone());

        builder
            .build(&request(root.path().join("1.0.0"), true))
            .await
            .unwrap();

        assert!(client.builds.lock().unwrap().is_empty());
        let annotations =
            BundleAnnotations::from_file(&root.path().join("metadata").join(ANNOTATIONS_FILE))
                .unwrap();
        assert_eq!(annotations.package(), Some("widget"));
        let dockerfile = std::fs::read_to_string(root.path().join(BUNDLE_DOCKERFILE)).unwrap();
        assert!(dockerfile.contains("COPY 1.0.0/ /manifests/"));
    }

    #[tokio::test]
    async fn test_missing_csv_fails_before_build() {
        let root = TempDir::new().unwrap();
        let client = Arc::new(RecordingClient::default());
        let builder = ImageBundleBuilder::new(client.clone());

        let err = builder
            .build(&request(root.path().to_path_buf(), false))
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::Manifest(ManifestError::MissingCsv { .. })));
        assert!(client.builds.lock().unwrap().is_empty());
    }

    #[test]
    fn test_default_channel_resolution() {
        let channels = vec!["preview".to_string(), "stable".to_string()];
        assert_eq!(resolve_default_channel(&channels, None).unwrap(), None);
        assert_eq!(
            resolve_default_channel(&channels, Some("stable")).unwrap(),
            Some("stable".to_string())
        );
        assert!(matches!(
            resolve_default_channel(&channels, Some("fast")),
            Err(BundleError::Channels(_))
        ));
        assert!(matches!(
            resolve_default_channel(&[], None),
            Err(BundleError::Channels(_))
        ));
        assert_eq!(
            resolve_default_channel(&channels[..1], None).unwrap(),
            Some("preview".to_string())
        );
    }
}
