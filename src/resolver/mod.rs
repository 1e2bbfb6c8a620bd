//! Version resolvers: "is there a newer version of this artifact?"
//!
//! A [`Resolver`] answers the question for one [`Source`] and never touches
//! a [`Deployment`](crate::models::Deployment). Resolvers are looked up by
//! [`ResolutionMethod`] in a [`ResolverSet`], so adding a backend means one
//! more [`ResolverSet::register`] call.
//!
//! | Method | Resolver | Looks at |
//! |--------|----------|----------|
//! | `Docker` | [`RegistryResolver`] | image ids, repo tags, version labels |
//! | `Helm` | [`ChartResolver`] | `{url}/index.yaml` |
//!
//! [`Resolver::check`] reports failures; [`Resolver::resolve`] logs them and
//! answers [`VersionCheck::Current`], which is what the reconciler wants: a
//! registry outage is "nothing new this cycle", not an error.

pub mod chart;
pub mod docker_cli;
pub mod oci;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::models::{ResolutionMethod, Source};

pub use chart::ChartResolver;
pub use docker_cli::DockerCli;
pub use oci::OciRegistry;
pub use registry::{ImageInspector, ImageMetadata, RegistryResolver};

/// Outcome of a version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    /// Nothing newer than the known version.
    Current,
    /// A different version is available.
    Newer(String),
}

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Look up the latest version of `source` and compare it with
    /// `known_version` (the record's latest version).
    async fn check(&self, source: &Source, known_version: &str) -> Result<VersionCheck>;

    /// [`check`](Resolver::check) with failures logged and treated as
    /// [`VersionCheck::Current`].
    async fn resolve(&self, source: &Source, known_version: &str) -> VersionCheck {
        match self.check(source, known_version).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    resolver = self.name(),
                    artifact = %source.artifact,
                    error = format!("{:#}", e),
                    "version resolution failed"
                );
                VersionCheck::Current
            }
        }
    }
}

/// Lookup table from resolution method to resolver.
#[derive(Clone, Default)]
pub struct ResolverSet {
    resolvers: HashMap<ResolutionMethod, Arc<dyn Resolver>>,
}

impl ResolverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard set: registry (via the configured inspector) and chart.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry_timeout = Duration::from_secs(config.registry.timeout_secs());
        let inspector: Arc<dyn ImageInspector> = match config.registry.backend.as_str() {
            "docker" => Arc::new(DockerCli::new(
                &config.registry.docker_binary,
                registry_timeout,
            )),
            "http" => Arc::new(
                OciRegistry::new(registry_timeout)?
                    .with_insecure(config.registry.insecure.clone())
                    .with_credentials(config.registry.credentials()),
            ),
            other => anyhow::bail!("Unknown registry backend: '{}'", other),
        };

        let mut set = Self::new();
        set.register(
            ResolutionMethod::Registry,
            Arc::new(RegistryResolver::new(inspector)),
        );
        set.register(
            ResolutionMethod::Chart,
            Arc::new(ChartResolver::new(Duration::from_secs(
                config.chart.timeout_secs,
            ))?),
        );
        Ok(set)
    }

    pub fn register(&mut self, method: ResolutionMethod, resolver: Arc<dyn Resolver>) {
        self.resolvers.insert(method, resolver);
    }

    pub fn get(&self, method: ResolutionMethod) -> Option<Arc<dyn Resolver>> {
        self.resolvers.get(&method).cloned()
    }
}
