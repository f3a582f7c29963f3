//! Container tool abstraction
//!
//! Every interaction with docker or podman goes through [`ContainerClient`].
//! The pipeline only needs a narrow set of operations: log in, build, push,
//! pull, and copy a path out of an image. [`ToolClient`] implements them by
//! spawning the selected executable; tests substitute an in-memory client.

mod process;

pub use process::ToolClient;

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::PipelineError;
use crate::image::ImageReference;

/// Supported container tools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerTool {
    Docker,
    Podman,
}

pub const SUPPORTED_TOOLS: &[&str] = &["docker", "podman"];

impl ContainerTool {
    /// Executable name
    pub fn program(&self) -> &'static str {
        match self {
            ContainerTool::Docker => "docker",
            ContainerTool::Podman => "podman",
        }
    }

    /// Validate the raw positional arguments of the binary
    ///
    /// Exactly one argument naming a supported tool is accepted. This runs
    /// before any external command.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, PipelineError> {
        match args {
            [] => Err(PipelineError::Usage(format!(
                "Must specify which container tool to use from {SUPPORTED_TOOLS:?}"
            ))),
            [tool] => tool.as_ref().parse(),
            _ => Err(PipelineError::Usage(
                "Too many command line arguments provided".to_string(),
            )),
        }
    }
}

impl FromStr for ContainerTool {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(ContainerTool::Docker),
            "podman" => Ok(ContainerTool::Podman),
            _ => Err(PipelineError::Usage(format!(
                "container tool argument must be one of {SUPPORTED_TOOLS:?}"
            ))),
        }
    }
}

impl fmt::Display for ContainerTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// Registry credentials
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Read username and password from the named environment variables
    pub fn from_env(username_var: &str, password_var: &str) -> Result<Self, ContainerError> {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ContainerError::MissingCredential {
                    variable: name.to_string(),
                })
        };
        Ok(Self::new(read(username_var)?, read(password_var)?))
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Errors from container tool invocations
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("failed to run {program}: {source}. Is it installed and in your PATH?")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}: {stderr}")]
    Exit {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("`{command}` did not finish within {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("environment variable {variable} is not set")]
    MissingCredential { variable: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image {0} is not available")]
    ImageNotFound(String),
}

/// Operations the pipeline needs from a container tool
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Authenticate against a registry host
    async fn login(&self, registry: &str, credentials: &Credentials) -> Result<(), ContainerError>;

    /// Build `context` with `dockerfile` and tag the result `image`
    async fn build(
        &self,
        dockerfile: &Path,
        context: &Path,
        image: &ImageReference,
    ) -> Result<(), ContainerError>;

    /// Push a local image; success is a zero exit status
    async fn push(&self, image: &ImageReference) -> Result<(), ContainerError>;

    /// Pull an image into the local store
    async fn pull(&self, image: &ImageReference) -> Result<(), ContainerError>;

    /// Copy `source` (an absolute path inside the image) to `dest`
    ///
    /// `dest` must not exist yet; it is created with the contents of `source`.
    async fn extract(
        &self,
        image: &ImageReference,
        source: &str,
        dest: &Path,
    ) -> Result<(), ContainerError>;
}
