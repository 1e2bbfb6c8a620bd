//! Update reconciler: records newly published versions.
//!
//! For each trackable deployment the resolver registered for its method is
//! asked for a newer version. A newer version is stored as
//! `latest_version` and announced; `current_version` is left alone until an
//! upgrade runs. One record failing never stops the others.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::models::Deployment;
use crate::notify::Notifier;
use crate::resolver::{ResolverSet, VersionCheck};
use crate::store::DeploymentStore;

/// What a full pass did, by deployment identity (`app.name`).
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: Vec<String>,
    pub skipped: Vec<String>,
    pub updated: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn summary(&self) -> String {
        format!(
            "checked {}, updated {}, skipped {}, failed {}",
            self.checked.len(),
            self.updated.len(),
            self.skipped.len(),
            self.failed.len()
        )
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn DeploymentStore>,
    resolvers: ResolverSet,
    notifier: Arc<dyn Notifier>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        resolvers: ResolverSet,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            resolvers,
            notifier,
        }
    }

    /// Check one record. Returns the stored record when a newer version was
    /// found; `None` when skipped or nothing changed.
    pub async fn reconcile_one(&self, deployment: &Deployment) -> Result<Option<Deployment>> {
        if !deployment.is_trackable() {
            tracing::debug!(deployment = %deployment.identity(), "not tracked, skipping");
            return Ok(None);
        }

        let resolver = self
            .resolvers
            .get(deployment.method)
            .with_context(|| format!("no resolver registered for method {}", deployment.method))?;

        let version = match resolver
            .resolve(&deployment.source(), &deployment.latest_version)
            .await
        {
            VersionCheck::Current => return Ok(None),
            VersionCheck::Newer(version) => version,
        };

        let previous = deployment.latest_version.clone();
        let mut updated = deployment.clone();
        updated.record_update(version);
        self.store
            .save(&updated)
            .await
            .with_context(|| format!("saving {}", updated.identity()))?;

        tracing::info!(
            deployment = %updated.identity(),
            from = %previous,
            to = %updated.latest_version,
            "new version recorded"
        );
        self.notifier
            .publish(&update_message(&updated, &previous))
            .await;
        Ok(Some(updated))
    }

    /// Check every record in the store. Fails only when the catalog itself
    /// cannot be loaded.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let deployments = self.store.load_all().await?;
        let mut report = ReconcileReport::default();

        for deployment in &deployments {
            let identity = deployment.identity();
            if !deployment.is_trackable() {
                report.skipped.push(identity);
                continue;
            }
            report.checked.push(identity.clone());
            match self.reconcile_one(deployment).await {
                Ok(Some(_)) => report.updated.push(identity),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        deployment = %identity,
                        error = format!("{:#}", e),
                        "reconcile failed"
                    );
                    report.failed.push(identity);
                }
            }
        }

        tracing::info!("{}", report.summary());
        Ok(report)
    }
}

/// Announcement for a newly recorded version.
pub fn update_message(deployment: &Deployment, previous_latest: &str) -> String {
    format!(
        "### {id} updated from {old} to version {new}\n\
         The image url is {url}/{artifact}\n\
         Refer to document in {doc}\n\
         Press 'upgrade {id}' to upgrade the app",
        id = deployment.identity(),
        old = previous_latest,
        new = deployment.latest_version,
        url = deployment.source_url,
        artifact = deployment.artifact,
        doc = deployment.document_url,
    )
}
