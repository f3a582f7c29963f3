//! Pipeline orchestrator
//!
//! Runs the stages strictly in order and stops at the first failure:
//!
//! ```text
//! Init → Authenticated → BundlesBuilt → BundlesPushed → IndexBuilt
//!      → IndexPushed → Exported → Verified → Done
//! ```
//!
//! Any failing step moves the pipeline to `Failed` and is returned as a
//! [`PipelineFailure`] naming the step. Nothing is retried and pushed images
//! are not cleaned up. The orchestrator never exits the process; the binary
//! decides the exit status.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use crate::bundle::{BundleBuilder, BundleSpec, ImageBundleBuilder};
use crate::catalog::CatalogSummary;
use crate::config::PipelineConfig;
use crate::container::{ContainerClient, ContainerTool, Credentials};
use crate::error::PipelineError;
use crate::export::{
    reset_download_dir, ExportError, ExportRequest, ImageIndexExporter, IndexExporter,
};
use crate::image::ImageReference;
use crate::index::{ImageIndexAdder, IndexAdder, IndexBuildRequest};
use crate::tags::RunIdentifiers;
use crate::verify::{CatalogVerifier, RoundTripExpectation, SqliteVerifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Authenticated,
    BundlesBuilt,
    BundlesPushed,
    IndexBuilt,
    IndexPushed,
    Exported,
    Verified,
    Done,
    Failed,
}

impl Stage {
    /// Fatal message logged when the step leading to this stage fails
    pub fn failure_message(&self) -> &'static str {
        match self {
            Stage::Init => "Error starting pipeline",
            Stage::Authenticated => "Error logging into registry",
            Stage::BundlesBuilt => "Error building bundles",
            Stage::BundlesPushed => "Error pushing bundles",
            Stage::IndexBuilt => "Error building index",
            Stage::IndexPushed => "Error pushing index",
            Stage::Exported => "Error exporting from index",
            Stage::Verified => "Error loading manifests from directory",
            Stage::Done | Stage::Failed => "Error finishing pipeline",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The step that failed and why
#[derive(Debug, thiserror::Error)]
#[error("{}: {}", .stage.failure_message(), .error)]
pub struct PipelineFailure {
    /// Stage the failing step would have reached
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

/// Everything a run needs, fixed before the first stage
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: PipelineConfig,
    pub tool: ContainerTool,
    pub identifiers: RunIdentifiers,
    /// Read from the configured environment variables at login when unset
    pub credentials: Option<Credentials>,
}

impl RunContext {
    pub fn new(
        config: PipelineConfig,
        tool: ContainerTool,
        identifiers: RunIdentifiers,
    ) -> Result<Self, PipelineError> {
        if identifiers.bundle_tags().len() != config.bundle_paths.len() {
            return Err(PipelineError::Config(format!(
                "{} bundle tag(s) generated for {} bundle(s)",
                identifiers.bundle_tags().len(),
                config.bundle_paths.len()
            )));
        }
        Ok(Self {
            config,
            tool,
            identifiers,
            credentials: None,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn bundle_specs(&self) -> Vec<BundleSpec> {
        self.config.bundle_specs()
    }

    /// Bundle images in declaration order
    pub fn bundle_images(&self) -> Vec<ImageReference> {
        self.identifiers
            .bundle_tags()
            .iter()
            .map(|tag| ImageReference::new(&self.config.bundle_repository, tag))
            .collect()
    }

    pub fn index_image(&self) -> ImageReference {
        ImageReference::new(&self.config.index_repository, self.identifiers.index_tag())
    }

    fn credentials(&self) -> Result<Credentials, PipelineError> {
        if let Some(credentials) = &self.credentials {
            return Ok(credentials.clone());
        }
        let vars = &self.config.credentials;
        Credentials::from_env(&vars.username, &vars.password).map_err(|source| {
            PipelineError::Auth {
                registry: self.config.registry.clone(),
                source,
            }
        })
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub bundle_images: Vec<ImageReference>,
    pub index_image: ImageReference,
    pub summary: CatalogSummary,
}

pub struct Pipeline {
    client: Arc<dyn ContainerClient>,
    bundle_builder: Arc<dyn BundleBuilder>,
    index_adder: Arc<dyn IndexAdder>,
    exporter: Arc<dyn IndexExporter>,
    verifier: Arc<dyn CatalogVerifier>,
    stage: Stage,
}

impl Pipeline {
    /// Pipeline with the image-based collaborators, all driven by `client`
    pub fn new(client: Arc<dyn ContainerClient>, config: &PipelineConfig) -> Self {
        Self {
            bundle_builder: Arc::new(ImageBundleBuilder::new(client.clone())),
            index_adder: Arc::new(ImageIndexAdder::new(client.clone())),
            exporter: Arc::new(ImageIndexExporter::new(client.clone())),
            verifier: Arc::new(
                SqliteVerifier::new(&config.database_dir).keep_database(config.keep_database),
            ),
            client,
            stage: Stage::Init,
        }
    }

    pub fn with_bundle_builder(mut self, builder: Arc<dyn BundleBuilder>) -> Self {
        self.bundle_builder = builder;
        self
    }

    pub fn with_index_adder(mut self, adder: Arc<dyn IndexAdder>) -> Self {
        self.index_adder = adder;
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn IndexExporter>) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn CatalogVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Run every stage once
    pub async fn run(&mut self, ctx: &RunContext) -> Result<PipelineReport, PipelineFailure> {
        self.stage = Stage::Init;
        match self.run_stages(ctx).await {
            Ok(report) => {
                self.enter(Stage::Done);
                Ok(report)
            }
            Err(failure) => {
                error!("{}", failure);
                self.stage = Stage::Failed;
                Err(failure)
            }
        }
    }

    fn enter(&mut self, stage: Stage) {
        info!("Pipeline stage {} -> {}", self.stage, stage);
        self.stage = stage;
    }

    async fn run_stages(&mut self, ctx: &RunContext) -> Result<PipelineReport, PipelineFailure> {
        let config = &ctx.config;
        let specs = ctx.bundle_specs();
        let bundle_images = ctx.bundle_images();
        let index_image = ctx.index_image();
        let fail = |stage: Stage| move |error: PipelineError| PipelineFailure { stage, error };

        // Authenticated
        let credentials = ctx.credentials().map_err(fail(Stage::Authenticated))?;
        self.client
            .login(&config.registry, &credentials)
            .await
            .map_err(|source| PipelineError::Auth {
                registry: config.registry.clone(),
                source,
            })
            .map_err(fail(Stage::Authenticated))?;
        self.enter(Stage::Authenticated);

        // BundlesBuilt
        for (spec, image) in specs.iter().zip(&bundle_images) {
            self.bundle_builder
                .build(&spec.build_request(image.clone()))
                .await
                .map_err(|source| PipelineError::Build {
                    image: image.to_string(),
                    source,
                })
                .map_err(fail(Stage::BundlesBuilt))?;
        }
        self.enter(Stage::BundlesBuilt);

        // BundlesPushed
        for image in &bundle_images {
            self.push(image).await.map_err(fail(Stage::BundlesPushed))?;
        }
        self.enter(Stage::BundlesPushed);

        // IndexBuilt
        let mut request = IndexBuildRequest::new(index_image.clone(), bundle_images.clone());
        request.binary_source_image = Some(config.binary_source_image.clone());
        self.index_adder
            .add_to_index(&request)
            .await
            .map_err(|source| PipelineError::IndexBuild {
                image: index_image.to_string(),
                source,
            })
            .map_err(fail(Stage::IndexBuilt))?;
        self.enter(Stage::IndexBuilt);

        // IndexPushed
        self.push(&index_image)
            .await
            .map_err(fail(Stage::IndexPushed))?;
        self.enter(Stage::IndexPushed);

        // Exported
        let export = ExportRequest {
            index: index_image.clone(),
            package: config.export_package().to_string(),
            download_path: config.export_dir.clone(),
            container_tool: ctx.tool,
        };
        let export_failed = |source: ExportError| PipelineError::Export {
            image: index_image.to_string(),
            source,
        };
        // Verification must only ever see what this run exported
        reset_download_dir(&export.download_path)
            .await
            .map_err(export_failed)
            .map_err(fail(Stage::Exported))?;
        self.exporter
            .export(&export)
            .await
            .map_err(export_failed)
            .map_err(fail(Stage::Exported))?;
        self.enter(Stage::Exported);

        // Verified
        let summary = self
            .verify(&export.package, &specs, &config.export_dir)
            .await
            .map_err(fail(Stage::Verified))?;
        self.enter(Stage::Verified);

        Ok(PipelineReport {
            bundle_images,
            index_image,
            summary,
        })
    }

    async fn push(&self, image: &ImageReference) -> Result<(), PipelineError> {
        self.client
            .push(image)
            .await
            .map_err(|source| PipelineError::Push {
                image: image.to_string(),
                source,
            })?;
        info!("Pushed {}", image);
        Ok(())
    }

    async fn verify(
        &self,
        package: &str,
        specs: &[BundleSpec],
        exported_dir: &Path,
    ) -> Result<CatalogSummary, PipelineError> {
        let summary = self.verifier.verify(exported_dir).await?;
        RoundTripExpectation::from_specs(package, specs)?.check(&summary)?;
        Ok(summary)
    }
}
