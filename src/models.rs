//! Core data models used throughout version-keeper.
//!
//! A [`Deployment`] is the tracked state of one application instance: where
//! its artifact comes from, which versions are known, and the [`Change`]s that
//! pin it inside the GitOps repository. Records are serialized with the field
//! names of the existing catalog documents, so the Rust names and the JSON
//! names differ in a few places (see the `serde(rename)` attributes).

use chrono::{Local, NaiveDateTime, Timelike};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Textual format of both record timestamps: `MM/DD/YYYY, HH:MM:SS`.
pub const TIMESTAMP_FORMAT: &str = "%m/%d/%Y, %H:%M:%S";

/// Current local time truncated to whole seconds, the precision the catalog
/// stores.
pub fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// One declarative edit applied during an upgrade.
///
/// `file` is relative to the repository root, `key` is a key path into the
/// first YAML document of that file (see [`crate::keypath`]), and `value` is
/// the template whose version token gets substituted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub file: String,
    pub key: String,
    pub value: String,
}

impl Change {
    pub fn new(file: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether both changes address the same location (file and key).
    pub fn same_target(&self, other: &Change) -> bool {
        self.file == other.file && self.key == other.key
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} = {}", self.file, self.key, self.value)
    }
}

/// Lifecycle status of a deployment.
///
/// Only `Stopped` changes behaviour (it suppresses reconciliation). Unknown
/// text is kept as-is so operators' own labels survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeploymentStatus {
    Running,
    Stopped,
    #[default]
    Unknown,
    Other(String),
}

impl From<String> for DeploymentStatus {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "stop" | "stopped" => Self::Stopped,
            "unknown" | "" => Self::Unknown,
            _ => Self::Other(value),
        }
    }
}

impl From<DeploymentStatus> for String {
    fn from(value: DeploymentStatus) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("Running"),
            Self::Stopped => f.write_str("Stopped"),
            Self::Unknown => f.write_str("Unknown"),
            Self::Other(text) => f.write_str(text),
        }
    }
}

/// How the latest available version of a deployment is discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResolutionMethod {
    /// Container image tags and labels in an OCI registry.
    #[default]
    #[serde(rename = "Docker", alias = "Registry", alias = "docker")]
    Registry,
    /// `index.yaml` of a Helm chart repository.
    #[serde(rename = "Helm", alias = "Chart", alias = "helm")]
    Chart,
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry => f.write_str("Docker"),
            Self::Chart => f.write_str("Helm"),
        }
    }
}

/// Where a deployment's artifact lives, as seen by a resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// Registry prefix (`ghcr.io/immich-app`) or chart repository URL.
    pub base_url: String,
    /// Image or chart name.
    pub artifact: String,
    /// Moving tag or channel resolved against (`latest`, `release`).
    pub target_version: String,
}

impl Source {
    /// Full image reference for `tag`: `{base}/{artifact}:{tag}`.
    ///
    /// An empty base yields `{artifact}:{tag}`, leaving the daemon or
    /// registry client to apply its default registry.
    pub fn image_reference(&self, tag: &str) -> String {
        let base = registry_prefix(&self.base_url);
        if base.is_empty() {
            format!("{}:{}", self.artifact, tag)
        } else {
            format!("{}/{}:{}", base, self.artifact, tag)
        }
    }
}

/// Registry host, port and namespace of `base`. An `http(s)://` URL is
/// parsed and reduced to `host[:port]/path`, dropping credentials, query and
/// default ports. Anything else is already a reference prefix.
fn registry_prefix(base: &str) -> String {
    let parsed = Url::parse(base)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"));
    let Some(url) = parsed else {
        return base.trim_end_matches('/').to_string();
    };
    let Some(host) = url.host_str() else {
        return base.trim_end_matches('/').to_string();
    };
    let mut prefix = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    prefix.push_str(url.path());
    prefix.trim_end_matches('/').to_string()
}

/// Tracked state for one application instance.
///
/// Identity is the `(app, name)` pair. `latest_version` is moved by the
/// reconciler, `current_version` only by a successful upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredDeployment")]
pub struct Deployment {
    pub id: String,
    pub app: String,
    pub name: String,
    /// Application name used by the orchestrator running the workload.
    #[serde(rename = "argo_app")]
    pub orchestrator_app: String,
    pub status: DeploymentStatus,
    #[serde(rename = "image_url")]
    pub source_url: String,
    #[serde(rename = "image_chart_name")]
    pub artifact: String,
    #[serde(rename = "image_check_method")]
    pub method: ResolutionMethod,
    pub current_version: String,
    pub latest_version: String,
    pub target_version: String,
    #[serde(rename = "hold_flag")]
    pub hold: bool,
    pub auto_update: bool,
    pub auto_upgrade: bool,
    pub changes: Vec<Change>,
    pub document_url: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub last_upgrade: NaiveDateTime,
    #[serde(serialize_with = "serialize_timestamp")]
    pub last_update: NaiveDateTime,
}

impl Deployment {
    /// A new record with the catalog defaults.
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        let app = app.into();
        let now = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            orchestrator_app: app.clone(),
            app,
            name: name.into(),
            status: DeploymentStatus::Unknown,
            source_url: String::new(),
            artifact: String::new(),
            method: ResolutionMethod::Registry,
            current_version: String::new(),
            latest_version: String::new(),
            target_version: default_target_version(),
            hold: false,
            auto_update: true,
            auto_upgrade: true,
            changes: Vec::new(),
            document_url: String::new(),
            last_upgrade: now,
            last_update: now,
        }
    }

    /// `app.name`, the form used by commands and messages.
    pub fn identity(&self) -> String {
        format!("{}.{}", self.app, self.name)
    }

    pub fn source(&self) -> Source {
        Source {
            base_url: self.source_url.clone(),
            artifact: self.artifact.clone(),
            target_version: self.target_version.clone(),
        }
    }

    /// Whether the reconciler should look for new versions.
    pub fn is_trackable(&self) -> bool {
        self.status != DeploymentStatus::Stopped && self.auto_update
    }

    /// A newer version has been seen but not yet rolled out.
    pub fn upgrade_pending(&self) -> bool {
        self.current_version != self.latest_version
    }

    /// Record a newly detected version.
    pub fn record_update(&mut self, version: impl Into<String>) {
        self.latest_version = version.into();
        self.last_update = now();
    }

    /// Record a completed rollout. Called by the upgrade engine only.
    pub fn record_upgrade(&mut self, version: impl Into<String>) {
        self.current_version = version.into();
        self.last_upgrade = now();
    }

    /// Append a change unless an identical one is already present.
    pub fn add_change(&mut self, change: Change) {
        if !self.changes.contains(&change) {
            self.changes.push(change);
        }
    }

    /// Replace every change addressing the same `(file, key)` as `change`.
    pub fn replace_change(&mut self, change: &Change) {
        tracing::debug!(file = %change.file, key = %change.key, "replacing change");
        for existing in self.changes.iter_mut() {
            if existing.same_target(change) {
                *existing = change.clone();
            }
        }
    }
}

fn default_target_version() -> String {
    "latest".to_string()
}

fn default_true() -> bool {
    true
}

/// On-disk shape of a record, with every optional field defaulted the way
/// the catalog has always treated missing or blank values.
#[derive(Deserialize)]
struct StoredDeployment {
    #[serde(default)]
    id: Option<String>,
    app: String,
    name: String,
    #[serde(default)]
    argo_app: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    image_chart_name: Option<String>,
    #[serde(default)]
    image_check_method: Option<ResolutionMethod>,
    #[serde(default)]
    current_version: Option<String>,
    #[serde(default)]
    latest_version: Option<String>,
    #[serde(default)]
    target_version: Option<String>,
    #[serde(default)]
    hold_flag: bool,
    #[serde(default = "default_true")]
    auto_update: bool,
    #[serde(default = "default_true")]
    auto_upgrade: bool,
    #[serde(default)]
    changes: Vec<Change>,
    #[serde(default)]
    document_url: Option<String>,
    #[serde(default)]
    last_upgrade: Option<String>,
    #[serde(default)]
    last_update: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_stamp(value: Option<String>) -> Result<NaiveDateTime, chrono::ParseError> {
    match non_blank(value) {
        Some(text) => NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT),
        None => Ok(now()),
    }
}

impl TryFrom<StoredDeployment> for Deployment {
    type Error = chrono::ParseError;

    fn try_from(raw: StoredDeployment) -> Result<Self, Self::Error> {
        let source_url = raw.image_url.unwrap_or_default();
        Ok(Self {
            id: non_blank(raw.id).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            orchestrator_app: non_blank(raw.argo_app).unwrap_or_else(|| raw.app.clone()),
            app: raw.app,
            name: raw.name,
            status: raw.status.map(DeploymentStatus::from).unwrap_or_default(),
            document_url: non_blank(raw.document_url).unwrap_or_else(|| source_url.clone()),
            source_url,
            artifact: raw.image_chart_name.unwrap_or_default(),
            method: raw.image_check_method.unwrap_or_default(),
            current_version: raw.current_version.unwrap_or_default(),
            latest_version: raw.latest_version.unwrap_or_default(),
            target_version: non_blank(raw.target_version).unwrap_or_else(default_target_version),
            hold: raw.hold_flag,
            auto_update: raw.auto_update,
            auto_upgrade: raw.auto_upgrade,
            changes: raw.changes,
            last_upgrade: parse_stamp(raw.last_upgrade)?,
            last_update: parse_stamp(raw.last_update)?,
        })
    }
}

fn serialize_timestamp<S: serde::Serializer>(
    value: &NaiveDateTime,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&value.format(TIMESTAMP_FORMAT))
}
