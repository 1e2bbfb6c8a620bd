//! Operations behind every command, CLI verb and HTTP route.
//!
//! [`Handlers`] owns the wired-up collaborators (store, resolvers, notifier,
//! upgrade engine) and applies the guards around them. Nothing above this
//! layer talks to the store or the engine directly.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::commands::Target;
use crate::config::Config;
use crate::models::Deployment;
use crate::notify::{create_notifier, Notifier};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::resolver::ResolverSet;
use crate::store::{create_store, DeploymentStore};
use crate::upgrade::UpgradeEngine;

/// Why an upgrade did or did not happen.
#[derive(Debug, Clone, PartialEq)]
pub enum UpgradeDecision {
    NotFound,
    AutoUpgradeDisabled,
    Held,
    UpToDate,
    Upgraded(Deployment),
}

impl UpgradeDecision {
    pub fn describe(&self, app: &str, name: &str) -> String {
        match self {
            Self::NotFound => format!("{}.{} not found", app, name),
            Self::AutoUpgradeDisabled => format!("{}.{} has auto-upgrade disabled", app, name),
            Self::Held => format!("{}.{} is on hold", app, name),
            Self::UpToDate => format!("{}.{} is already up to date", app, name),
            Self::Upgraded(d) => format!("{} upgraded to {}", d.identity(), d.current_version),
        }
    }
}

#[derive(Clone)]
pub struct Handlers {
    store: Arc<dyn DeploymentStore>,
    notifier: Arc<dyn Notifier>,
    reconciler: Reconciler,
    engine: Option<UpgradeEngine>,
}

impl Handlers {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        resolvers: ResolverSet,
        notifier: Arc<dyn Notifier>,
        engine: Option<UpgradeEngine>,
    ) -> Self {
        let reconciler = Reconciler::new(store.clone(), resolvers, notifier.clone());
        Self {
            store,
            notifier,
            reconciler,
            engine,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let store = create_store(&config.store)?;
        let resolvers = ResolverSet::from_config(config)?;
        let notifier = create_notifier(&config.notify)?;
        let engine = config.repository.as_ref().map(UpgradeEngine::from_config);
        Ok(Self::new(store, resolvers, notifier, engine))
    }

    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    pub async fn update_all(&self) -> Result<ReconcileReport> {
        self.reconciler.reconcile_all().await
    }

    /// Check one deployment. Returns the record if a newer version was stored.
    pub async fn update_one(&self, app: &str, name: &str) -> Result<Option<Deployment>> {
        let deployment = self
            .store
            .load(app, name)
            .await?
            .with_context(|| format!("deployment {}.{} not found", app, name))?;
        self.reconciler.reconcile_one(&deployment).await
    }

    /// Upgrade one deployment if every guard allows it.
    ///
    /// Guards, in order: the record exists, auto-upgrade is on, it is not
    /// held, and `current_version != latest_version`. Engine failures
    /// propagate and leave the stored record untouched.
    pub async fn upgrade(&self, app: &str, name: &str) -> Result<UpgradeDecision> {
        let Some(deployment) = self.store.load(app, name).await? else {
            return Ok(UpgradeDecision::NotFound);
        };
        if !deployment.auto_upgrade {
            return Ok(UpgradeDecision::AutoUpgradeDisabled);
        }
        if deployment.hold {
            return Ok(UpgradeDecision::Held);
        }
        if !deployment.upgrade_pending() {
            return Ok(UpgradeDecision::UpToDate);
        }

        let engine = self
            .engine
            .clone()
            .context("no [repository] configured; upgrades are disabled")?;
        let previous = deployment.current_version.clone();
        let outcome = tokio::task::spawn_blocking(move || engine.upgrade(&deployment))
            .await
            .context("upgrade task panicked")??;

        let upgraded = outcome.deployment;
        self.store
            .save(&upgraded)
            .await
            .with_context(|| format!("saving {}", upgraded.identity()))?;
        self.notifier
            .publish(&upgrade_message(&upgraded, &previous))
            .await;
        Ok(UpgradeDecision::Upgraded(upgraded))
    }

    /// Markdown table of one or all deployments, published and returned.
    pub async fn status(&self, target: &Target) -> Result<String> {
        let deployments = match target {
            Target::All => self.store.load_all().await?,
            Target::One { app, name } => self.store.load(app, name).await?.into_iter().collect(),
        };
        let message = status_table(&deployments);
        self.notifier.publish(&message).await;
        Ok(message)
    }

    /// Insert or replace a record.
    pub async fn set_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.store.save(deployment).await?;
        tracing::info!(deployment = %deployment.identity(), "deployment saved");
        Ok(())
    }

    /// Freeze a deployment at its current version. Returns false if missing.
    pub async fn hold(&self, app: &str, name: &str) -> Result<bool> {
        self.set_hold(app, name, true).await
    }

    pub async fn release(&self, app: &str, name: &str) -> Result<bool> {
        self.set_hold(app, name, false).await
    }

    async fn set_hold(&self, app: &str, name: &str, hold: bool) -> Result<bool> {
        let Some(mut deployment) = self.store.load(app, name).await? else {
            return Ok(false);
        };
        if deployment.hold != hold {
            deployment.hold = hold;
            self.store.save(&deployment).await?;
        }
        tracing::info!(deployment = %deployment.identity(), hold, "hold flag set");
        Ok(true)
    }

    pub async fn remove(&self, app: &str, name: &str) -> Result<bool> {
        let removed = self.store.remove(app, name).await?;
        if removed {
            tracing::info!(deployment = %format!("{}.{}", app, name), "deployment removed");
        }
        Ok(removed)
    }
}

/// Announcement for a completed upgrade.
pub fn upgrade_message(deployment: &Deployment, previous_current: &str) -> String {
    format!(
        "### Upgrade {} from {} to {}\nRefer to the [document]({}) for more details.",
        deployment.identity(),
        previous_current,
        deployment.current_version,
        deployment.document_url
    )
}

pub fn status_table(deployments: &[Deployment]) -> String {
    if deployments.is_empty() {
        return "### No deployments found".to_string();
    }
    let mut message = String::from("### Here are all the deployments:\n");
    message.push_str(
        "| App_Name | Status | Image | Current Version | Latest Version | Hold | Auto_Update | Auto Upgrade| Document URL|\n",
    );
    message.push_str("| --- | --- | --- | --- | --- | --- | --- | --- | --- |\n");
    for d in deployments {
        message.push_str(&format!(
            "| {} | {} | {}/{} | {} | {} | {} | {} | {} | {} |\n",
            d.identity(),
            d.status,
            d.source_url,
            d.artifact,
            d.current_version,
            d.latest_version,
            d.hold,
            d.auto_update,
            d.auto_upgrade,
            d.document_url
        ));
    }
    message
}
