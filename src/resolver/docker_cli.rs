//! [`ImageInspector`] backed by the local Docker daemon.
//!
//! Runs `docker pull -q <ref>` followed by `docker image inspect <ref>`.
//! The pull is what refreshes a moving tag, so both steps run on every
//! inspection. Each command is bounded by the configured timeout.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::registry::{ImageInspector, ImageMetadata};

pub struct DockerCli {
    binary: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| {
                format!(
                    "'{} {}' timed out after {}s",
                    self.binary,
                    args.join(" "),
                    self.timeout.as_secs()
                )
            })?
            .with_context(|| format!("Failed to execute '{}'. Is docker installed?", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} {} failed: {}", self.binary, args[0], stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ImageInspector for DockerCli {
    async fn inspect(&self, reference: &str) -> Result<ImageMetadata> {
        tracing::debug!(reference, "docker pull");
        self.run(&["pull", "-q", reference]).await?;
        let out = self.run(&["image", "inspect", reference]).await?;
        parse_inspect_output(&out).with_context(|| format!("inspecting {}", reference))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    #[serde(default)]
    config: Option<InspectConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

/// Parse `docker image inspect` JSON (an array with one entry per image).
pub fn parse_inspect_output(text: &str) -> Result<ImageMetadata> {
    let entries: Vec<InspectEntry> =
        serde_json::from_str(text).context("unexpected docker inspect output")?;
    let entry = entries
        .into_iter()
        .next()
        .context("docker inspect returned no images")?;

    Ok(ImageMetadata {
        id: entry.id,
        repo_tags: entry.repo_tags.unwrap_or_default(),
        labels: entry.config.and_then(|c| c.labels).unwrap_or_default(),
    })
}
