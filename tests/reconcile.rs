//! Reconciliation passes over an in-memory catalog with scripted resolvers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use version_keeper::models::{
    Deployment, DeploymentStatus, ResolutionMethod, Source, TIMESTAMP_FORMAT,
};
use version_keeper::notify::RecordingNotifier;
use version_keeper::reconcile::Reconciler;
use version_keeper::resolver::{
    ImageInspector, ImageMetadata, RegistryResolver, Resolver, ResolverSet, VersionCheck,
};
use version_keeper::store::{DeploymentStore, InMemoryStore};

// ─── Test doubles ───────────────────────────────────────────────────

/// Store wrapper counting writes, optionally refusing to save one record.
struct CountingStore {
    inner: InMemoryStore,
    saves: AtomicUsize,
    rejects: Option<String>,
}

impl CountingStore {
    fn new(deployments: Vec<Deployment>) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::with(deployments),
            saves: AtomicUsize::new(0),
            rejects: None,
        })
    }

    fn rejecting(deployments: Vec<Deployment>, identity: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::with(deployments),
            saves: AtomicUsize::new(0),
            rejects: Some(identity.to_string()),
        })
    }

    fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeploymentStore for CountingStore {
    async fn load_all(&self) -> Result<Vec<Deployment>> {
        self.inner.load_all().await
    }

    async fn save(&self, deployment: &Deployment) -> Result<()> {
        if self.rejects.as_deref() == Some(deployment.identity().as_str()) {
            anyhow::bail!("disk full");
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(deployment).await
    }

    async fn remove(&self, app: &str, name: &str) -> Result<bool> {
        self.inner.remove(app, name).await
    }

    async fn exists(&self) -> Result<bool> {
        self.inner.exists().await
    }

    async fn create(&self) -> Result<()> {
        self.inner.create().await
    }
}

fn long_ago() -> NaiveDateTime {
    NaiveDateTime::parse_from_str("01/01/2020, 00:00:00", TIMESTAMP_FORMAT).unwrap()
}

/// Image metadata keyed by full reference.
struct Images(HashMap<String, ImageMetadata>);

#[async_trait]
impl ImageInspector for Images {
    async fn inspect(&self, reference: &str) -> Result<ImageMetadata> {
        self.0
            .get(reference)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("manifest unknown: {}", reference))
    }
}

/// Chart resolver answering from a fixed table, failing for unknown charts.
struct Charts {
    latest: HashMap<String, String>,
    asked: Mutex<Vec<String>>,
}

impl Charts {
    fn new(entries: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            latest: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            asked: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Resolver for Charts {
    fn name(&self) -> &str {
        "charts"
    }

    async fn check(&self, source: &Source, known: &str) -> Result<VersionCheck> {
        self.asked.lock().unwrap().push(source.artifact.clone());
        let latest = self
            .latest
            .get(&source.artifact)
            .ok_or_else(|| anyhow::anyhow!("index unreachable"))?;
        Ok(if latest == known {
            VersionCheck::Current
        } else {
            VersionCheck::Newer(latest.clone())
        })
    }
}

fn image(id: &str, tags: &[&str]) -> ImageMetadata {
    ImageMetadata {
        id: id.to_string(),
        repo_tags: tags.iter().map(|t| t.to_string()).collect(),
        labels: HashMap::new(),
    }
}

fn immich() -> Deployment {
    let mut d = Deployment::new("immich", "server");
    d.source_url = "repo".into();
    d.artifact = "img".into();
    d.target_version = "release".into();
    d.current_version = "v1.0".into();
    d.latest_version = "v1.0".into();
    d.document_url = "https://immich.app/docs".into();
    d
}

fn chart(app: &str, name: &str, artifact: &str, version: &str) -> Deployment {
    let mut d = Deployment::new(app, name);
    d.method = ResolutionMethod::Chart;
    d.source_url = "https://charts.example.com".into();
    d.artifact = artifact.into();
    d.current_version = version.into();
    d.latest_version = version.into();
    d
}

fn resolvers(images: Vec<(&str, ImageMetadata)>, charts: Arc<Charts>) -> ResolverSet {
    let images = Images(
        images
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    );
    let mut set = ResolverSet::new();
    set.register(
        ResolutionMethod::Registry,
        Arc::new(RegistryResolver::new(Arc::new(images))),
    );
    set.register(ResolutionMethod::Chart, charts);
    set
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_moved_tag_records_new_version() {
    let mut record = immich();
    record.last_update = long_ago();
    let store = CountingStore::new(vec![record]);
    let notifier = RecordingNotifier::new();
    let resolvers = resolvers(
        vec![
            ("repo/img:v1.0", image("sha256:aaa", &["repo/img:v1.0"])),
            (
                "repo/img:release",
                image("sha256:bbb", &["repo/img:release", "repo/img:v1.1"]),
            ),
        ],
        Charts::new(&[]),
    );
    let reconciler = Reconciler::new(store.clone(), resolvers, Arc::new(notifier.clone()));

    let report = reconciler.reconcile_all().await.unwrap();
    assert_eq!(report.updated, vec!["immich.server"]);

    let stored = store.load("immich", "server").await.unwrap().unwrap();
    assert_eq!(stored.latest_version, "v1.1");
    assert_eq!(stored.current_version, "v1.0");
    assert!(stored.upgrade_pending());
    assert!(stored.last_update > long_ago());

    let messages = notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("### immich.server updated from v1.0 to version v1.1\n"));
    assert!(messages[0].contains("The image url is repo/img"));
    assert!(messages[0].ends_with("Press 'upgrade immich.server' to upgrade the app"));
}

#[tokio::test]
async fn test_unchanged_image_is_current() {
    let store = CountingStore::new(vec![immich()]);
    let notifier = RecordingNotifier::new();
    let same = image("sha256:aaa", &["repo/img:v1.0", "repo/img:release"]);
    let resolvers = resolvers(
        vec![("repo/img:v1.0", same.clone()), ("repo/img:release", same)],
        Charts::new(&[]),
    );
    let reconciler = Reconciler::new(store.clone(), resolvers, Arc::new(notifier.clone()));

    let report = reconciler.reconcile_all().await.unwrap();
    assert_eq!(report.checked, vec!["immich.server"]);
    assert!(report.updated.is_empty());
    assert_eq!(store.saves(), 0);
    assert!(notifier.messages().is_empty());
}

#[tokio::test]
async fn test_stopped_and_untracked_records_are_skipped() {
    let mut stopped = chart("gitlab", "stopped", "gitlab", "8.6.2");
    stopped.status = DeploymentStatus::Stopped;
    let mut manual = chart("gitlab", "manual", "gitlab", "8.6.2");
    manual.auto_update = false;

    let charts = Charts::new(&[("gitlab", "8.7.0")]);
    let store = CountingStore::new(vec![stopped, manual]);
    let notifier = RecordingNotifier::new();
    let reconciler = Reconciler::new(
        store.clone(),
        resolvers(vec![], charts.clone()),
        Arc::new(notifier.clone()),
    );

    let report = reconciler.reconcile_all().await.unwrap();
    assert_eq!(report.skipped, vec!["gitlab.stopped", "gitlab.manual"]);
    assert!(report.checked.is_empty());
    assert!(charts.asked.lock().unwrap().is_empty());
    assert_eq!(store.saves(), 0);
    assert!(notifier.messages().is_empty());
}

#[tokio::test]
async fn test_same_chart_version_writes_nothing() {
    let store = CountingStore::new(vec![chart("gitlab", "gitlab-helm", "gitlab", "8.7.0")]);
    let notifier = RecordingNotifier::new();
    let reconciler = Reconciler::new(
        store.clone(),
        resolvers(vec![], Charts::new(&[("gitlab", "8.7.0")])),
        Arc::new(notifier.clone()),
    );

    let updated = reconciler
        .reconcile_one(&chart("gitlab", "gitlab-helm", "gitlab", "8.7.0"))
        .await
        .unwrap();
    assert!(updated.is_none());
    assert_eq!(store.saves(), 0);
    assert!(notifier.messages().is_empty());
}

#[tokio::test]
async fn test_one_failing_record_does_not_stop_the_pass() {
    // `broken` has no index entry; its resolver error is logged and ignored.
    let store = CountingStore::new(vec![
        chart("a", "broken", "missing", "1.0"),
        chart("b", "fine", "runner", "0.9.0"),
    ]);
    let notifier = RecordingNotifier::new();
    let reconciler = Reconciler::new(
        store.clone(),
        resolvers(vec![], Charts::new(&[("runner", "0.10.0")])),
        Arc::new(notifier.clone()),
    );

    let report = reconciler.reconcile_all().await.unwrap();
    assert_eq!(report.checked.len(), 2);
    assert_eq!(report.updated, vec!["b.fine"]);
    assert_eq!(store.saves(), 1);

    let broken = store.load("a", "broken").await.unwrap().unwrap();
    assert_eq!(broken.latest_version, "1.0");
    let fine = store.load("b", "fine").await.unwrap().unwrap();
    assert_eq!(fine.latest_version, "0.10.0");
}

#[tokio::test]
async fn test_missing_resolver_is_reported_as_failure() {
    let store = CountingStore::new(vec![immich()]);
    let reconciler = Reconciler::new(
        store.clone(),
        ResolverSet::new(),
        Arc::new(RecordingNotifier::new()),
    );

    let report = reconciler.reconcile_all().await.unwrap();
    assert_eq!(report.failed, vec!["immich.server"]);
    assert_eq!(store.saves(), 0);
}

#[tokio::test]
async fn test_failed_save_is_reported_and_pass_continues() {
    let mut rejected = chart("a", "rejected", "runner", "0.9.0");
    rejected.last_update = long_ago();
    let mut fine = chart("b", "fine", "runner", "0.9.0");
    fine.last_update = long_ago();

    let store = CountingStore::rejecting(vec![rejected, fine], "a.rejected");
    let notifier = RecordingNotifier::new();
    let reconciler = Reconciler::new(
        store.clone(),
        resolvers(vec![], Charts::new(&[("runner", "0.10.0")])),
        Arc::new(notifier.clone()),
    );

    let report = reconciler.reconcile_all().await.unwrap();
    assert_eq!(report.checked, vec!["a.rejected", "b.fine"]);
    assert_eq!(report.failed, vec!["a.rejected"]);
    assert_eq!(report.updated, vec!["b.fine"]);

    // The rejected record is untouched; the other one moved on.
    let rejected = store.load("a", "rejected").await.unwrap().unwrap();
    assert_eq!(rejected.latest_version, "0.9.0");
    assert_eq!(rejected.last_update, long_ago());
    let fine = store.load("b", "fine").await.unwrap().unwrap();
    assert_eq!(fine.latest_version, "0.10.0");
    assert!(fine.last_update > long_ago());

    // Only the saved record is announced.
    let messages = notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("### b.fine updated from 0.9.0 to version 0.10.0\n"));
}
