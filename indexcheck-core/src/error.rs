//! Top-level pipeline error taxonomy
//!
//! Each variant corresponds to one failing stage and wraps the component
//! error that caused it. The first error wins; nothing is retried.

use crate::bundle::BundleError;
use crate::catalog::CatalogError;
use crate::container::ContainerError;
use crate::export::ExportError;
use crate::index::IndexError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Bad command line, raised before any external call
    #[error("{0}")]
    Usage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to log into {registry}: {source}")]
    Auth {
        registry: String,
        #[source]
        source: ContainerError,
    },

    #[error("failed to build bundle {image}: {source}")]
    Build {
        image: String,
        #[source]
        source: BundleError,
    },

    #[error("failed to push {image}: {source}")]
    Push {
        image: String,
        #[source]
        source: ContainerError,
    },

    #[error("failed to build index {image}: {source}")]
    IndexBuild {
        image: String,
        #[source]
        source: IndexError,
    },

    #[error("failed to export from index {image}: {source}")]
    Export {
        image: String,
        #[source]
        source: ExportError,
    },

    #[error("failed to load exported manifests: {0}")]
    Load(#[from] CatalogError),
}

impl PipelineError {
    /// Usage errors exit with a distinct status
    pub fn is_usage(&self) -> bool {
        matches!(self, PipelineError::Usage(_))
    }
}
