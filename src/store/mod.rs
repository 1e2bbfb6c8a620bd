//! Durable catalog of [`Deployment`] records.
//!
//! The [`DeploymentStore`] trait is the only way the rest of the crate reads
//! or writes records. Every backend keeps the whole catalog as one JSON array
//! (the document format shared with earlier deployments of the tool), so the
//! helpers here handle encoding and upsert semantics once for all of them.
//!
//! | Backend | Module | Notes |
//! |---------|--------|-------|
//! | `file` | [`file`] | local JSON file, atomic replace |
//! | `s3` | [`s3`] | single object in an S3-compatible bucket |
//! | `memory` | [`memory`] | tests and dry runs |
//!
//! Each backend serializes its own read-modify-write cycles with an async
//! mutex. Nothing coordinates separate processes sharing one document.

pub mod file;
pub mod memory;
pub mod s3;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::models::Deployment;

pub use file::JsonFileStore;
pub use memory::InMemoryStore;
pub use s3::S3Store;

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Every record in catalog order. A catalog that does not exist yet is
    /// empty.
    async fn load_all(&self) -> Result<Vec<Deployment>>;

    async fn load(&self, app: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .find(|d| d.app == app && d.name == name))
    }

    /// Insert or replace the record with the same `(app, name)`.
    async fn save(&self, deployment: &Deployment) -> Result<()>;

    /// Delete a record. Returns whether it existed.
    async fn remove(&self, app: &str, name: &str) -> Result<bool>;

    /// Whether the catalog document itself has been created.
    async fn exists(&self) -> Result<bool>;

    /// Write an empty catalog if none exists yet. An existing catalog is
    /// left untouched.
    async fn create(&self) -> Result<()>;

    async fn contains(&self, app: &str, name: &str) -> Result<bool> {
        Ok(self.load(app, name).await?.is_some())
    }
}

/// Build the store selected by `[store].backend`.
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn DeploymentStore>> {
    match config.backend.as_str() {
        "file" => Ok(Arc::new(JsonFileStore::new(&config.path))),
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        "s3" => {
            let s3 = config
                .s3
                .as_ref()
                .context("store.s3 must be set when store.backend = 's3'")?;
            Ok(Arc::new(S3Store::new(s3.clone())?))
        }
        other => anyhow::bail!("Unknown store backend: '{}'", other),
    }
}

/// Parse a catalog document. Blank text is an empty catalog.
pub fn decode(text: &str) -> Result<Vec<Deployment>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(text).context("Failed to parse deployment catalog")
}

pub fn encode(deployments: &[Deployment]) -> Result<String> {
    let mut text =
        serde_json::to_string_pretty(deployments).context("Failed to encode deployment catalog")?;
    text.push('\n');
    Ok(text)
}

/// Replace the record matching `deployment`'s identity, or append it.
pub fn upsert(deployments: &mut Vec<Deployment>, deployment: &Deployment) {
    match deployments
        .iter_mut()
        .find(|d| d.app == deployment.app && d.name == deployment.name)
    {
        Some(existing) => *existing = deployment.clone(),
        None => deployments.push(deployment.clone()),
    }
}

/// Drop the record with identity `(app, name)`. Returns whether one was found.
pub fn delete(deployments: &mut Vec<Deployment>, app: &str, name: &str) -> bool {
    let before = deployments.len();
    deployments.retain(|d| !(d.app == app && d.name == name));
    deployments.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_blank_is_empty() {
        assert!(decode("").unwrap().is_empty());
        assert!(decode("  \n").unwrap().is_empty());
        assert!(decode("[]").unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("{not json").is_err());
    }

    #[test]
    fn test_upsert_replaces_by_identity() {
        let mut all = vec![Deployment::new("a", "x"), Deployment::new("b", "y")];
        let mut changed = Deployment::new("a", "x");
        changed.latest_version = "2.0".into();

        upsert(&mut all, &changed);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].latest_version, "2.0");

        upsert(&mut all, &Deployment::new("c", "z"));
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_delete() {
        let mut all = vec![Deployment::new("a", "x"), Deployment::new("a", "y")];
        assert!(delete(&mut all, "a", "x"));
        assert!(!delete(&mut all, "a", "x"));
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "y");
    }

    #[test]
    fn test_encode_decode_keeps_order() {
        let all = vec![Deployment::new("b", "1"), Deployment::new("a", "2")];
        let back = decode(&encode(&all).unwrap()).unwrap();
        assert_eq!(back, all);
    }
}
