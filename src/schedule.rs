//! Periodic reconciliation.
//!
//! Every tick runs a full [`Handlers::update_all`] pass. With auto-upgrade
//! on, each record that pass updated is then offered to
//! [`Handlers::upgrade`], so hold and auto-upgrade flags still apply. Ticks
//! never overlap: a slow pass delays the next one.

use std::time::Duration;

use anyhow::Result;
use tokio::time::MissedTickBehavior;

use crate::commands::parse_identity;
use crate::handlers::{Handlers, UpgradeDecision};

/// One scheduled pass. Failures are logged; the schedule keeps going.
pub async fn tick(handlers: &Handlers, auto_upgrade: bool) {
    let report = match handlers.update_all().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = format!("{:#}", e), "scheduled update failed");
            return;
        }
    };
    if !auto_upgrade {
        return;
    }

    for identity in &report.updated {
        let Ok((app, name)) = parse_identity(identity) else {
            continue;
        };
        match handlers.upgrade(&app, &name).await {
            Ok(UpgradeDecision::Upgraded(d)) => tracing::info!(
                deployment = %d.identity(),
                version = %d.current_version,
                "auto-upgraded"
            ),
            Ok(decision) => tracing::info!("{}", decision.describe(&app, &name)),
            Err(e) => tracing::error!(
                deployment = %identity,
                error = format!("{:#}", e),
                "scheduled upgrade failed"
            ),
        }
    }
}

/// Run [`tick`] every `interval` until Ctrl-C.
pub async fn run_watch(handlers: Handlers, interval: Duration, auto_upgrade: bool) -> Result<()> {
    tracing::info!(
        interval_secs = interval.as_secs(),
        auto_upgrade,
        "watching for new versions"
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => tick(&handlers, auto_upgrade).await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("stopping watch");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::models::{Deployment, ResolutionMethod, Source};
    use crate::notify::RecordingNotifier;
    use crate::resolver::{Resolver, ResolverSet, VersionCheck};
    use crate::store::InMemoryStore;

    struct Fixed(&'static str);

    #[async_trait]
    impl Resolver for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn check(&self, _source: &Source, known: &str) -> Result<VersionCheck> {
            Ok(if known == self.0 {
                VersionCheck::Current
            } else {
                VersionCheck::Newer(self.0.to_string())
            })
        }
    }

    fn handlers(deployments: Vec<Deployment>) -> (Handlers, RecordingNotifier) {
        let mut resolvers = ResolverSet::new();
        resolvers.register(ResolutionMethod::Chart, Arc::new(Fixed("2.0")));
        let notifier = RecordingNotifier::new();
        let handlers = Handlers::new(
            Arc::new(InMemoryStore::with(deployments)),
            resolvers,
            Arc::new(notifier.clone()),
            None,
        );
        (handlers, notifier)
    }

    fn chart(app: &str, name: &str) -> Deployment {
        let mut d = Deployment::new(app, name);
        d.method = ResolutionMethod::Chart;
        d.current_version = "1.0".into();
        d.latest_version = "1.0".into();
        d
    }

    #[tokio::test]
    async fn test_tick_records_new_versions() {
        let (h, notifier) = handlers(vec![chart("a", "b")]);
        tick(&h, false).await;

        let stored = h.store().load("a", "b").await.unwrap().unwrap();
        assert_eq!(stored.latest_version, "2.0");
        assert_eq!(stored.current_version, "1.0");
        assert_eq!(notifier.messages().len(), 1);

        // Second pass finds nothing new.
        tick(&h, false).await;
        assert_eq!(notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_upgrade_respects_hold() {
        let mut held = chart("a", "b");
        held.hold = true;
        let (h, _) = handlers(vec![held]);

        // Held: the upgrade guard answers before the missing engine matters.
        tick(&h, true).await;
        let stored = h.store().load("a", "b").await.unwrap().unwrap();
        assert_eq!(stored.latest_version, "2.0");
        assert_eq!(stored.current_version, "1.0");
    }
}
