//! [`ImageInspector`] speaking the registry HTTP API directly.
//!
//! Implements the read side of the Docker Registry v2 / OCI distribution
//! protocol: manifest fetch (following manifest lists and OCI indexes to the
//! `linux/amd64` entry), config blob fetch for labels, and the bearer token
//! dance announced by `WWW-Authenticate`. No daemon or disk space needed.
//!
//! The registry API has no notion of "all tags pointing at this digest", so
//! [`ImageMetadata::repo_tags`] is always empty here and the version comes
//! from labels.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::registry::{ImageInspector, ImageMetadata};

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.v2+json";

pub struct OciRegistry {
    client: reqwest::Client,
    insecure: Vec<String>,
    credentials: Option<(String, String)>,
}

impl OciRegistry {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("version-keeper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            insecure: Vec::new(),
            credentials: None,
        })
    }

    /// Registry hosts (`host:port`) to reach over plain HTTP.
    pub fn with_insecure(mut self, hosts: Vec<String>) -> Self {
        self.insecure = hosts;
        self
    }

    /// Basic credentials presented to the token endpoint.
    pub fn with_credentials(mut self, credentials: Option<(String, String)>) -> Self {
        self.credentials = credentials;
        self
    }

    fn base_url(&self, registry: &str) -> String {
        let scheme = if self.insecure.iter().any(|h| h == registry) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, registry)
    }

    async fn send(
        &self,
        url: &str,
        accept: &str,
        token: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut req = self.client.get(url).header(ACCEPT, accept);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send()
            .await
            .with_context(|| format!("request to {} failed", url))
    }

    /// GET `/v2/{repository}/{path}`, answering one bearer challenge.
    async fn fetch(
        &self,
        image: &ImageRef,
        token: &mut Option<String>,
        path: &str,
        accept: &str,
    ) -> Result<reqwest::Response> {
        let url = format!(
            "{}/v2/{}/{}",
            self.base_url(&image.registry),
            image.repository,
            path
        );
        let resp = self.send(&url, accept, token.as_deref()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return ensure_success(resp, &url).await;
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge)
            .with_context(|| format!("{} returned 401 without a bearer challenge", url))?;
        let fresh = self.fetch_token(&challenge, &image.repository).await?;
        let resp = self.send(&url, accept, Some(&fresh)).await?;
        *token = Some(fresh);
        ensure_success(resp, &url).await
    }

    async fn fetch_token(&self, challenge: &Challenge, repository: &str) -> Result<String> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", repository));
        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        let mut req = self.client.get(&challenge.realm).query(&query);
        if let Some((user, pass)) = &self.credentials {
            req = req.basic_auth(user, Some(pass));
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("token request to {} failed", challenge.realm))?;
        let resp = ensure_success(resp, &challenge.realm).await?;

        let body: TokenResponse = resp.json().await.context("invalid token response")?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .context("token response carried no token")
    }
}

async fn ensure_success(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    bail!(
        "GET {} failed (HTTP {}): {}",
        url,
        status,
        body.chars().take(300).collect::<String>()
    )
}

#[async_trait]
impl ImageInspector for OciRegistry {
    async fn inspect(&self, reference: &str) -> Result<ImageMetadata> {
        let image = ImageRef::parse(reference)?;
        let mut token = None;

        let path = format!("manifests/{}", image.reference);
        let resp = self.fetch(&image, &mut token, &path, MANIFEST_ACCEPT).await?;
        let header_digest = resp
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?;
        let id = header_digest
            .unwrap_or_else(|| format!("sha256:{}", hex::encode(Sha256::digest(&body))));

        let mut manifest: ManifestDoc =
            serde_json::from_slice(&body).context("invalid manifest document")?;
        let platform_digest = match &manifest.manifests {
            Some(entries) => Some(
                select_manifest(entries)
                    .context("manifest index is empty")?
                    .digest
                    .clone(),
            ),
            None => None,
        };
        if let Some(digest) = platform_digest {
            let path = format!("manifests/{}", digest);
            let resp = self.fetch(&image, &mut token, &path, MANIFEST_ACCEPT).await?;
            manifest = resp.json().await.context("invalid platform manifest")?;
        }

        let config_digest = manifest
            .config
            .map(|c| c.digest)
            .context("manifest has no config descriptor")?;
        let resp = self
            .fetch(&image, &mut token, &format!("blobs/{}", config_digest), "*/*")
            .await?;
        let config: ImageConfig = serde_json::from_slice(&resp.bytes().await?)
            .context("invalid image config blob")?;

        Ok(ImageMetadata {
            id,
            repo_tags: Vec::new(),
            labels: config.config.and_then(|c| c.labels).unwrap_or_default(),
        })
    }
}

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// API host, `registry-1.docker.io` for Docker Hub.
    pub registry: String,
    pub repository: String,
    /// Tag or digest.
    pub reference: String,
}

impl ImageRef {
    pub fn parse(text: &str) -> Result<Self> {
        let (name, digest) = match text.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (text, None),
        };

        let slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[slash..].find(':') {
            Some(i) => (&name[..slash + i], Some(&name[slash + i + 1..])),
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB.to_string(), name.to_string()),
        };
        if repository.is_empty() {
            bail!("invalid image reference '{}'", text);
        }

        let (registry, repository) = if registry == DOCKER_HUB || registry == "index.docker.io" {
            let repository = if repository.contains('/') {
                repository
            } else {
                format!("library/{}", repository)
            };
            (DOCKER_HUB_API.to_string(), repository)
        } else {
            (registry, repository)
        };

        let reference = digest
            .or(tag)
            .filter(|r| !r.is_empty())
            .unwrap_or("latest")
            .to_string();

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Some(Challenge {
        realm: params.remove("realm")?,
        service: params.remove("service"),
        scope: params.remove("scope"),
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct ManifestDoc {
    #[serde(default)]
    manifests: Option<Vec<ManifestEntry>>,
    #[serde(default)]
    config: Option<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

#[derive(Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Deserialize)]
struct ImageConfig {
    #[serde(default)]
    config: Option<ContainerConfig>,
}

#[derive(Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

fn select_manifest(entries: &[ManifestEntry]) -> Option<&ManifestEntry> {
    entries
        .iter()
        .find(|e| {
            e.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
        })
        .or_else(|| entries.first())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(registry: &str, repository: &str, reference: &str) -> ImageRef {
        ImageRef {
            registry: registry.into(),
            repository: repository.into(),
            reference: reference.into(),
        }
    }

    #[test]
    fn test_parse_docker_hub_short_names() {
        assert_eq!(
            ImageRef::parse("nginx").unwrap(),
            image("registry-1.docker.io", "library/nginx", "latest")
        );
        assert_eq!(
            ImageRef::parse("vaultwarden/server:1.32.5").unwrap(),
            image("registry-1.docker.io", "vaultwarden/server", "1.32.5")
        );
        assert_eq!(
            ImageRef::parse("docker.io/library/redis:7").unwrap(),
            image("registry-1.docker.io", "library/redis", "7")
        );
    }

    #[test]
    fn test_parse_custom_registries() {
        assert_eq!(
            ImageRef::parse("ghcr.io/immich-app/immich-server:release").unwrap(),
            image("ghcr.io", "immich-app/immich-server", "release")
        );
        assert_eq!(
            ImageRef::parse("localhost:5000/team/app").unwrap(),
            image("localhost:5000", "team/app", "latest")
        );
        assert_eq!(
            ImageRef::parse("quay.io/org/app:v1@sha256:abcd").unwrap(),
            image("quay.io", "org/app", "sha256:abcd")
        );
    }

    #[test]
    fn test_parse_rejects_empty_repository() {
        assert!(ImageRef::parse("ghcr.io/").is_err());
    }

    #[test]
    fn test_parse_challenge() {
        let c = parse_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:org/app:pull""#,
        )
        .unwrap();
        assert_eq!(c.realm, "https://ghcr.io/token");
        assert_eq!(c.service.as_deref(), Some("ghcr.io"));
        assert_eq!(c.scope.as_deref(), Some("repository:org/app:pull"));
    }

    #[test]
    fn test_parse_challenge_scope_with_commas() {
        let c = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token", scope="repository:a/b:pull,push", service="registry.docker.io""#,
        )
        .unwrap();
        assert_eq!(c.scope.as_deref(), Some("repository:a/b:pull,push"));
        assert_eq!(c.service.as_deref(), Some("registry.docker.io"));
    }

    #[test]
    fn test_parse_challenge_rejects_basic() {
        assert!(parse_challenge(r#"Basic realm="registry""#).is_none());
        assert!(parse_challenge(r#"Bearer service="x""#).is_none());
    }

    #[test]
    fn test_select_manifest_prefers_linux_amd64() {
        let entries: Vec<ManifestEntry> = serde_json::from_str(
            r#"[
                {"digest": "sha256:arm", "platform": {"architecture": "arm64", "os": "linux"}},
                {"digest": "sha256:amd", "platform": {"architecture": "amd64", "os": "linux"}}
            ]"#,
        )
        .unwrap();
        assert_eq!(select_manifest(&entries).unwrap().digest, "sha256:amd");
        assert_eq!(select_manifest(&entries[..1]).unwrap().digest, "sha256:arm");
        assert!(select_manifest(&[]).is_none());
    }

    #[test]
    fn test_insecure_hosts_use_http() {
        let reg = OciRegistry::new(Duration::from_secs(1))
            .unwrap()
            .with_insecure(vec!["localhost:5000".into()]);
        assert_eq!(reg.base_url("localhost:5000"), "http://localhost:5000");
        assert_eq!(reg.base_url("ghcr.io"), "https://ghcr.io");
    }
}
