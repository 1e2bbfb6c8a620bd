//! In-memory [`DeploymentStore`] for tests and dry runs.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{delete, upsert, DeploymentStore};
use crate::models::Deployment;

#[derive(Default)]
pub struct InMemoryStore {
    deployments: RwLock<Vec<Deployment>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(deployments: Vec<Deployment>) -> Self {
        Self {
            deployments: RwLock::new(deployments),
        }
    }
}

#[async_trait]
impl DeploymentStore for InMemoryStore {
    async fn load_all(&self) -> Result<Vec<Deployment>> {
        Ok(self.deployments.read().await.clone())
    }

    async fn save(&self, deployment: &Deployment) -> Result<()> {
        upsert(&mut *self.deployments.write().await, deployment);
        Ok(())
    }

    async fn remove(&self, app: &str, name: &str) -> Result<bool> {
        Ok(delete(&mut *self.deployments.write().await, app, name))
    }

    async fn exists(&self) -> Result<bool> {
        Ok(true)
    }

    async fn create(&self) -> Result<()> {
        Ok(())
    }
}
