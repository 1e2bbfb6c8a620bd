//! Registry resolver: detects when a moving tag points at new content.
//!
//! The image behind the record's latest version and the image behind the
//! target tag are inspected. Same id means nothing moved. Otherwise the
//! target image is searched for a concrete version, in priority order:
//!
//! 1. a repository tag other than the target tag itself,
//! 2. the `org.opencontainers.image.version` label,
//! 3. a plain `version` label.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{Resolver, VersionCheck};
use crate::models::Source;

pub const OCI_VERSION_LABEL: &str = "org.opencontainers.image.version";
pub const VERSION_LABEL: &str = "version";

/// What an inspector learns about one image reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Content identity (image id or manifest digest).
    pub id: String,
    /// Full references known for the image (`repo/img:v1.1`).
    pub repo_tags: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Fetches metadata for an image reference (`registry/repo:tag`).
#[async_trait]
pub trait ImageInspector: Send + Sync {
    async fn inspect(&self, reference: &str) -> Result<ImageMetadata>;
}

pub struct RegistryResolver {
    inspector: Arc<dyn ImageInspector>,
}

impl RegistryResolver {
    pub fn new(inspector: Arc<dyn ImageInspector>) -> Self {
        Self { inspector }
    }
}

#[async_trait]
impl Resolver for RegistryResolver {
    fn name(&self) -> &str {
        "registry"
    }

    async fn check(&self, source: &Source, known_version: &str) -> Result<VersionCheck> {
        let target_ref = source.image_reference(&source.target_version);

        let current = if known_version.is_empty() {
            None
        } else {
            let current_ref = source.image_reference(known_version);
            Some(
                self.inspector
                    .inspect(&current_ref)
                    .await
                    .with_context(|| format!("inspecting {}", current_ref))?,
            )
        };
        let target = self
            .inspector
            .inspect(&target_ref)
            .await
            .with_context(|| format!("inspecting {}", target_ref))?;

        if current.is_some_and(|c| c.id == target.id) {
            return Ok(VersionCheck::Current);
        }

        let version = extract_version(&target, &source.target_version)
            .with_context(|| format!("no version tag or label on {}", target_ref))?;
        if version == known_version {
            return Ok(VersionCheck::Current);
        }
        tracing::debug!(reference = %target_ref, version = %version, "registry reports new content");
        Ok(VersionCheck::Newer(version))
    }
}

/// The tag part of a full reference: `ghcr.io:443/org/app:v1` → `v1`.
fn tag_of(reference: &str) -> Option<&str> {
    let name = reference.split('@').next().unwrap_or(reference);
    let last = name.rsplit('/').next().unwrap_or(name);
    last.split_once(':').map(|(_, tag)| tag)
}

/// First version token found on `image`, skipping the moving `target_tag`.
pub fn extract_version(image: &ImageMetadata, target_tag: &str) -> Option<String> {
    let from_tags = image
        .repo_tags
        .iter()
        .filter_map(|r| tag_of(r))
        .find(|tag| !tag.is_empty() && *tag != target_tag);

    from_tags
        .or_else(|| image.labels.get(OCI_VERSION_LABEL).map(String::as_str))
        .or_else(|| image.labels.get(VERSION_LABEL).map(String::as_str))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeInspector {
        images: HashMap<String, ImageMetadata>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeInspector {
        fn new(images: Vec<(&str, ImageMetadata)>) -> Arc<Self> {
            Arc::new(Self {
                images: images
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ImageInspector for FakeInspector {
        async fn inspect(&self, reference: &str) -> Result<ImageMetadata> {
            self.calls.lock().unwrap().push(reference.to_string());
            self.images
                .get(reference)
                .cloned()
                .with_context(|| format!("manifest unknown: {}", reference))
        }
    }

    fn image(id: &str, tags: &[&str], labels: &[(&str, &str)]) -> ImageMetadata {
        ImageMetadata {
            id: id.into(),
            repo_tags: tags.iter().map(|t| t.to_string()).collect(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn source(target: &str) -> Source {
        Source {
            base_url: "ghcr.io/org".into(),
            artifact: "app".into(),
            target_version: target.into(),
        }
    }

    #[test]
    fn test_tag_priority() {
        let img = image(
            "sha256:1",
            &["ghcr.io/org/app:release", "ghcr.io/org/app:v1.1"],
            &[(OCI_VERSION_LABEL, "1.1.0"), (VERSION_LABEL, "x")],
        );
        assert_eq!(extract_version(&img, "release").as_deref(), Some("v1.1"));
    }

    #[test]
    fn test_label_fallbacks() {
        let img = image(
            "sha256:1",
            &["ghcr.io/org/app:release"],
            &[(OCI_VERSION_LABEL, "1.1.0"), (VERSION_LABEL, "x")],
        );
        assert_eq!(extract_version(&img, "release").as_deref(), Some("1.1.0"));

        let img = image("sha256:1", &[], &[(VERSION_LABEL, "2.0")]);
        assert_eq!(extract_version(&img, "latest").as_deref(), Some("2.0"));

        let img = image("sha256:1", &["localhost:5000/app:latest"], &[]);
        assert_eq!(extract_version(&img, "latest"), None);
    }

    #[test]
    fn test_tag_of_handles_registry_ports() {
        assert_eq!(tag_of("localhost:5000/app:v2"), Some("v2"));
        assert_eq!(tag_of("localhost:5000/app"), None);
        assert_eq!(tag_of("app:1@sha256:abc"), Some("1"));
    }

    #[tokio::test]
    async fn test_same_id_is_current() {
        let fake = FakeInspector::new(vec![
            ("ghcr.io/org/app:v1.0", image("sha256:a", &[], &[])),
            ("ghcr.io/org/app:release", image("sha256:a", &[], &[])),
        ]);
        let resolver = RegistryResolver::new(fake.clone());
        let result = resolver.check(&source("release"), "v1.0").await.unwrap();
        assert_eq!(result, VersionCheck::Current);
        assert_eq!(fake.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_moved_tag_reports_new_version() {
        let fake = FakeInspector::new(vec![
            ("ghcr.io/org/app:v1.0", image("sha256:a", &[], &[])),
            (
                "ghcr.io/org/app:release",
                image("sha256:b", &["ghcr.io/org/app:release", "ghcr.io/org/app:v1.1"], &[]),
            ),
        ]);
        let resolver = RegistryResolver::new(fake);
        let result = resolver.check(&source("release"), "v1.0").await.unwrap();
        assert_eq!(result, VersionCheck::Newer("v1.1".into()));
    }

    #[tokio::test]
    async fn test_no_version_is_a_failure_not_an_update() {
        let fake = FakeInspector::new(vec![
            ("ghcr.io/org/app:v1.0", image("sha256:a", &[], &[])),
            ("ghcr.io/org/app:release", image("sha256:b", &[], &[])),
        ]);
        let resolver = RegistryResolver::new(fake);
        assert!(resolver.check(&source("release"), "v1.0").await.is_err());
        assert_eq!(
            resolver.resolve(&source("release"), "v1.0").await,
            VersionCheck::Current
        );
    }

    #[tokio::test]
    async fn test_empty_known_version_skips_current_side() {
        let fake = FakeInspector::new(vec![(
            "ghcr.io/org/app:latest",
            image("sha256:b", &[], &[(OCI_VERSION_LABEL, "3.2.1")]),
        )]);
        let resolver = RegistryResolver::new(fake.clone());
        let result = resolver.check(&source("latest"), "").await.unwrap();
        assert_eq!(result, VersionCheck::Newer("3.2.1".into()));
        assert_eq!(
            *fake.calls.lock().unwrap(),
            vec!["ghcr.io/org/app:latest".to_string()]
        );
    }

    #[tokio::test]
    async fn test_found_version_equal_to_known_is_current() {
        // Rebuilt image, same version label.
        let fake = FakeInspector::new(vec![
            ("ghcr.io/org/app:2.0", image("sha256:a", &[], &[])),
            ("ghcr.io/org/app:latest", image("sha256:b", &[], &[(VERSION_LABEL, "2.0")])),
        ]);
        let resolver = RegistryResolver::new(fake);
        let result = resolver.check(&source("latest"), "2.0").await.unwrap();
        assert_eq!(result, VersionCheck::Current);
    }
}
