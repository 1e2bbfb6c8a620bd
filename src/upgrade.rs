//! Upgrade engine: pins a deployment to its latest version in the GitOps
//! repository.
//!
//! # Workflow
//!
//! 1. **Acquire** the working copy through [`UpgradeEngine::checkout`]: take
//!    the engine's lock, then fetch + hard-reset an existing clone or clone
//!    fresh, and set the bot identity.
//! 2. **Apply** every [`Change`] in list order with
//!    [`manifest::apply_change`]. A failing change is logged and left as it
//!    was; the rest still apply.
//! 3. **Advance** the record: `current_version = latest_version`.
//! 4. **Commit & push** staged modifications of tracked files, then pause for
//!    `settle` so CI can register the push.
//!
//! Only step 1 and step 4 can fail the upgrade. A failure there leaves the
//! remote untouched (the local tree may be dirty; the next checkout resets
//! it) and the caller must not persist anything.
//!
//! The engine is synchronous. Async callers run it on a blocking thread.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::config::RepositoryConfig;
use crate::git::{authenticated_url, GitError, Repository};
use crate::manifest::{self, PatchError};
use crate::models::{self, Change, Deployment, TIMESTAMP_FORMAT};

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("failed to acquire the working copy")]
    Acquire(#[source] GitError),

    #[error("failed to commit the upgrade")]
    Commit(#[source] GitError),

    #[error("failed to push the upgrade")]
    Push(#[source] GitError),
}

/// Where the repository lives and how to talk to it.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub url: String,
    pub branch: String,
    pub local_path: PathBuf,
    pub token: Option<String>,
    pub bot_name: String,
    pub bot_email: String,
    pub settle: Duration,
    pub stall_secs: u64,
    pub timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &RepositoryConfig) -> Self {
        Self {
            url: config.url.clone(),
            branch: config.branch.clone(),
            local_path: config.local_path.clone(),
            token: config.token(),
            bot_name: config.bot_name.clone(),
            bot_email: config.bot_email.clone(),
            settle: Duration::from_secs(config.settle_secs),
            stall_secs: config.stall_secs,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// A change that could not be applied, with the reason.
#[derive(Debug)]
pub struct ChangeFailure {
    pub change: Change,
    pub error: PatchError,
}

/// Result of a completed upgrade.
#[derive(Debug)]
pub struct UpgradeOutcome {
    /// The advanced record, changes rewritten. Not yet persisted.
    pub deployment: Deployment,
    /// Changes as rewritten on disk.
    pub applied: Vec<Change>,
    pub failed: Vec<ChangeFailure>,
    /// False when no tracked file changed, so nothing was pushed.
    pub committed: bool,
}

/// Exclusive access to the synchronized working copy. Released on drop.
pub struct Checkout<'a> {
    repo: Repository,
    _guard: MutexGuard<'a, ()>,
}

impl Checkout<'_> {
    pub fn root(&self) -> &Path {
        self.repo.root()
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }
}

#[derive(Clone)]
pub struct UpgradeEngine {
    settings: EngineSettings,
    lock: Arc<Mutex<()>>,
}

impl UpgradeEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_config(config: &RepositoryConfig) -> Self {
        Self::new(EngineSettings::from_config(config))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Lock and synchronize the working copy.
    pub fn checkout(&self) -> Result<Checkout<'_>, UpgradeError> {
        // A panic mid-upgrade leaves nothing that the next sync won't reset.
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let s = &self.settings;
        let repo = Repository::open(&s.local_path)
            .with_stall_secs(s.stall_secs)
            .with_timeout(s.timeout)
            .with_secret(s.token.clone());
        let remote = authenticated_url(&s.url, s.token.as_deref());

        if repo.is_cloned() {
            tracing::debug!(path = %s.local_path.display(), "refreshing working copy");
            repo.set_remote(&remote).map_err(UpgradeError::Acquire)?;
            repo.sync(&s.branch).map_err(UpgradeError::Acquire)?;
        } else {
            tracing::info!(path = %s.local_path.display(), "cloning GitOps repository");
            repo.clone_from(&remote, &s.branch)
                .map_err(UpgradeError::Acquire)?;
        }
        repo.set_identity(&s.bot_name, &s.bot_email)
            .map_err(UpgradeError::Acquire)?;

        Ok(Checkout {
            repo,
            _guard: guard,
        })
    }

    /// Roll `deployment` from its current to its latest version.
    pub fn upgrade(&self, deployment: &Deployment) -> Result<UpgradeOutcome, UpgradeError> {
        let checkout = self.checkout()?;
        let from = deployment.current_version.clone();
        let to = deployment.latest_version.clone();

        let mut updated = deployment.clone();
        let mut applied = Vec::new();
        let mut failed = Vec::new();
        for change in &deployment.changes {
            match manifest::apply_change(checkout.root(), change, &from, &to) {
                Ok(rewritten) => {
                    updated.replace_change(&rewritten);
                    applied.push(rewritten);
                }
                Err(error) => {
                    tracing::warn!(
                        deployment = %deployment.identity(),
                        change = %change,
                        error = %error,
                        "change not applied"
                    );
                    failed.push(ChangeFailure {
                        change: change.clone(),
                        error,
                    });
                }
            }
        }

        updated.record_upgrade(to.clone());

        let committed = self.commit_and_push(&checkout, deployment, &from, &to)?;
        tracing::info!(
            deployment = %deployment.identity(),
            from = %from,
            to = %to,
            applied = applied.len(),
            failed = failed.len(),
            committed,
            "upgrade finished"
        );

        Ok(UpgradeOutcome {
            deployment: updated,
            applied,
            failed,
            committed,
        })
    }

    fn commit_and_push(
        &self,
        checkout: &Checkout<'_>,
        deployment: &Deployment,
        from: &str,
        to: &str,
    ) -> Result<bool, UpgradeError> {
        let repo = checkout.repository();
        repo.stage_tracked().map_err(UpgradeError::Commit)?;
        if !repo.has_staged_changes().map_err(UpgradeError::Commit)? {
            tracing::info!(deployment = %deployment.identity(), "no file changed, nothing to push");
            return Ok(false);
        }

        let (subject, body) = commit_message(deployment, from, to);
        repo.commit(&subject, &body).map_err(UpgradeError::Commit)?;
        repo.push(&self.settings.branch)
            .map_err(UpgradeError::Push)?;

        if !self.settings.settle.is_zero() {
            std::thread::sleep(self.settings.settle);
        }
        Ok(true)
    }
}

/// Subject and body of the upgrade commit.
pub fn commit_message(deployment: &Deployment, from: &str, to: &str) -> (String, String) {
    let subject = format!("Upgrade {} to {}", deployment.name, to);
    let body = format!(
        "Upgrade {} in App {} from {} to {} at {}",
        deployment.name,
        deployment.app,
        from,
        to,
        models::now().format(TIMESTAMP_FORMAT)
    );
    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(tmp: &TempDir) -> EngineSettings {
        EngineSettings {
            url: tmp.path().join("missing-remote.git").display().to_string(),
            branch: "main".into(),
            local_path: tmp.path().join("work"),
            token: None,
            bot_name: "Bot".into(),
            bot_email: "bot@localhost".into(),
            settle: Duration::ZERO,
            stall_secs: 5,
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_commit_message() {
        let mut d = Deployment::new("gitlab", "gitlab-helm");
        d.current_version = "8.6.2".into();
        let (subject, body) = commit_message(&d, "8.6.2", "8.7.0");
        assert_eq!(subject, "Upgrade gitlab-helm to 8.7.0");
        assert!(body.starts_with("Upgrade gitlab-helm in App gitlab from 8.6.2 to 8.7.0 at "));
    }

    #[test]
    fn test_unreachable_remote_is_acquire_error_and_releases_lock() {
        let tmp = TempDir::new().unwrap();
        let engine = UpgradeEngine::new(settings(&tmp));

        let err = engine.upgrade(&Deployment::new("a", "b")).unwrap_err();
        assert!(matches!(err, UpgradeError::Acquire(_)));
        // Lock was released with the failed checkout.
        assert!(matches!(engine.checkout(), Err(UpgradeError::Acquire(_))));
    }
}
