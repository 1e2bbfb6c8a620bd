//! Catalog kept in a local JSON file.
//!
//! Writes go to a temporary file in the same directory which is then renamed
//! over the catalog, so readers never see a half-written document.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{decode, delete, encode, upsert, DeploymentStore};
use crate::models::Deployment;

pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<Deployment>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => decode(&text)
                .with_context(|| format!("Invalid catalog at {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    async fn write(&self, deployments: &[Deployment]) -> Result<()> {
        let text = encode(deployments)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, text.as_bytes()))
            .await
            .context("catalog writer panicked")?
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl DeploymentStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<Deployment>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn save(&self, deployment: &Deployment) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut all = self.read().await?;
        upsert(&mut all, deployment);
        self.write(&all).await
    }

    async fn remove(&self, app: &str, name: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut all = self.read().await?;
        if !delete(&mut all, app, name) {
            return Ok(false);
        }
        self.write(&all).await?;
        Ok(true)
    }

    async fn exists(&self) -> Result<bool> {
        tokio::fs::try_exists(&self.path)
            .await
            .with_context(|| format!("Failed to stat {}", self.path.display()))
    }

    async fn create(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.exists().await? {
            return Ok(());
        }
        tracing::info!(path = %self.path.display(), "creating empty catalog");
        self.write(&[]).await
    }
}
