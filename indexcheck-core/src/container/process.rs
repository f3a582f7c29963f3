//! Subprocess-backed container client

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{ContainerClient, ContainerError, ContainerTool, Credentials};
use crate::image::ImageReference;

/// Placeholder command for `create`; the container is never started
const NOOP_ENTRYPOINT: &str = "indexcheck-noop";

/// Drives docker or podman as an external executable
///
/// Each call blocks the pipeline until the child exits. With a timeout set,
/// an overrunning child is killed and reported as [`ContainerError::Timeout`].
#[derive(Debug, Clone)]
pub struct ToolClient {
    tool: ContainerTool,
    timeout: Option<Duration>,
}

impl ToolClient {
    pub fn new(tool: ContainerTool) -> Self {
        Self {
            tool,
            timeout: None,
        }
    }

    /// Bound every subprocess by `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn render(&self, args: &[OsString]) -> String {
        let mut rendered = self.tool.program().to_string();
        for arg in args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        rendered
    }

    /// Run the tool with `args`, optionally feeding `stdin`
    async fn run(&self, args: Vec<OsString>, stdin: Option<&[u8]>) -> Result<Output, ContainerError> {
        let command_line = self.render(&args);
        debug!("Running: {}", command_line);

        let mut child = Command::new(self.tool.program())
            .args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ContainerError::Spawn {
                program: self.tool.program().to_string(),
                source,
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.flush().await?;
        }

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ContainerError::Timeout {
                    command: command_line.clone(),
                    seconds: limit.as_secs(),
                })??,
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            return Err(ContainerError::Exit {
                command: command_line,
                status: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        trace!(
            "Completed: {} ({} bytes stdout)",
            command_line,
            output.stdout.len()
        );
        Ok(output)
    }
}

fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}

#[async_trait]
impl ContainerClient for ToolClient {
    async fn login(&self, registry: &str, credentials: &Credentials) -> Result<(), ContainerError> {
        // Password goes over stdin so it never shows up in the process list
        self.run(
            args([
                "login",
                "--username",
                credentials.username.as_str(),
                "--password-stdin",
                registry,
            ]),
            Some(credentials.password().as_bytes()),
        )
        .await
        .map(|_| ())
    }

    async fn build(
        &self,
        dockerfile: &Path,
        context: &Path,
        image: &ImageReference,
    ) -> Result<(), ContainerError> {
        let argv = vec![
            OsString::from("build"),
            OsString::from("-f"),
            dockerfile.as_os_str().to_owned(),
            OsString::from("-t"),
            OsString::from(image.to_string()),
            context.as_os_str().to_owned(),
        ];
        self.run(argv, None).await.map(|_| ())
    }

    async fn push(&self, image: &ImageReference) -> Result<(), ContainerError> {
        self.run(args(["push".to_string(), image.to_string()]), None)
            .await
            .map(|_| ())
    }

    async fn pull(&self, image: &ImageReference) -> Result<(), ContainerError> {
        self.run(args(["pull".to_string(), image.to_string()]), None)
            .await
            .map(|_| ())
    }

    async fn extract(
        &self,
        image: &ImageReference,
        source: &str,
        dest: &Path,
    ) -> Result<(), ContainerError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let created = self
            .run(
                args([
                    "create".to_string(),
                    image.to_string(),
                    NOOP_ENTRYPOINT.to_string(),
                ]),
                None,
            )
            .await?;
        let container_id = String::from_utf8_lossy(&created.stdout).trim().to_string();

        let copied = self
            .run(
                vec![
                    OsString::from("cp"),
                    OsString::from(format!("{container_id}:{source}")),
                    dest.as_os_str().to_owned(),
                ],
                None,
            )
            .await;

        // Remove the container whether or not the copy worked; the copy error wins
        let removed = self.run(args(["rm", container_id.as_str()]), None).await;
        copied?;
        removed.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_command_line() {
        let client = ToolClient::new(ContainerTool::Podman);
        let rendered = client.render(&args(["push", "quay.io/a/b:c"]));
        assert_eq!(rendered, "podman push quay.io/a/b:c");
    }

    #[test]
    fn test_with_timeout() {
        let client = ToolClient::new(ContainerTool::Docker).with_timeout(Some(Duration::from_secs(5)));
        assert_eq!(client.timeout, Some(Duration::from_secs(5)));
        assert_eq!(client.tool, ContainerTool::Docker);
    }
}
