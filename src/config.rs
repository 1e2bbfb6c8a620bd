use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Default tracing filter when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub store: StoreConfig,
    /// GitOps repository; required for upgrades only.
    #[serde(default)]
    pub repository: Option<RepositoryConfig>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub chart: ChartConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub s3: Option<S3StoreConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
            s3: None,
        }
    }
}

fn default_store_backend() -> String {
    "file".to_string()
}
fn default_store_path() -> PathBuf {
    PathBuf::from("./data/deployments.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3StoreConfig {
    pub bucket: String,
    #[serde(default = "default_s3_key")]
    pub key: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_s3_key() -> String {
    "deployments.json".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepositoryConfig {
    /// Remote URL of the GitOps repository.
    pub url: String,
    /// Where the working copy lives.
    pub local_path: PathBuf,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Environment variable holding an access token for HTTPS remotes.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    #[serde(default = "default_bot_email")]
    pub bot_email: String,
    /// Pause after a push so CI can pick up the commit.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// Abort a git transfer that stays below 1 KB/s for this long.
    #[serde(default = "default_git_stall_secs")]
    pub stall_secs: u64,
    /// Kill any single git command that runs longer than this.
    #[serde(default = "default_git_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_branch() -> String {
    "main".to_string()
}
fn default_bot_name() -> String {
    "Bot".to_string()
}
fn default_bot_email() -> String {
    "bot@localhost".to_string()
}
fn default_settle_secs() -> u64 {
    5
}
fn default_git_stall_secs() -> u64 {
    30
}
fn default_git_timeout_secs() -> u64 {
    300
}

impl RepositoryConfig {
    /// The access token, if `token_env` is set and the variable exists.
    pub fn token(&self) -> Option<String> {
        self.token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// `docker` (local daemon via CLI) or `http` (registry API).
    #[serde(default = "default_registry_backend")]
    pub backend: String,
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    /// Per-call bound: one pull for `docker`, one request for `http`.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Registry hosts reached over plain HTTP.
    #[serde(default)]
    pub insecure: Vec<String>,
    #[serde(default)]
    pub username_env: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: default_registry_backend(),
            docker_binary: default_docker_binary(),
            timeout_secs: None,
            insecure: Vec::new(),
            username_env: None,
            password_env: None,
        }
    }
}

fn default_registry_backend() -> String {
    "docker".to_string()
}
fn default_docker_binary() -> String {
    "docker".to_string()
}

impl RegistryConfig {
    pub fn timeout_secs(&self) -> u64 {
        match (self.timeout_secs, self.backend.as_str()) {
            (Some(secs), _) => secs,
            (None, "docker") => 300,
            (None, _) => default_http_timeout(),
        }
    }

    /// Basic credentials for token requests, when both variables are set.
    pub fn credentials(&self) -> Option<(String, String)> {
        let user = std::env::var(self.username_env.as_deref()?).ok()?;
        let pass = std::env::var(self.password_env.as_deref()?).ok()?;
        Some((user, pass))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChartConfig {
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_http_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    /// `log` or `webhook`.
    #[serde(default = "default_notify_backend")]
    pub backend: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            backend: default_notify_backend(),
            webhook_url: None,
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_notify_backend() -> String {
    "log".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upgrade records right after a new version is found.
    #[serde(default)]
    pub auto_upgrade: bool,
}

fn default_interval_secs() -> u64 {
    3600
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.store.backend.as_str() {
        "file" | "memory" => {}
        "s3" => {
            let s3 = config
                .store
                .s3
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("store.s3 must be set when store.backend = 's3'"))?;
            if s3.bucket.is_empty() {
                anyhow::bail!("store.s3.bucket must not be empty");
            }
        }
        other => anyhow::bail!(
            "Unknown store backend: '{}'. Must be file, s3, or memory.",
            other
        ),
    }

    match config.registry.backend.as_str() {
        "docker" | "http" => {}
        other => anyhow::bail!(
            "Unknown registry backend: '{}'. Must be docker or http.",
            other
        ),
    }
    if config.registry.timeout_secs() == 0 {
        anyhow::bail!("registry.timeout_secs must be > 0");
    }
    if config.chart.timeout_secs == 0 {
        anyhow::bail!("chart.timeout_secs must be > 0");
    }

    match config.notify.backend.as_str() {
        "log" => {}
        "webhook" => {
            if config.notify.webhook_url.is_none() {
                anyhow::bail!("notify.webhook_url must be set when notify.backend = 'webhook'");
            }
        }
        other => anyhow::bail!(
            "Unknown notify backend: '{}'. Must be log or webhook.",
            other
        ),
    }

    if let Some(repo) = &config.repository {
        if repo.url.is_empty() {
            anyhow::bail!("repository.url must not be empty");
        }
        if repo.branch.is_empty() {
            anyhow::bail!("repository.branch must not be empty");
        }
        if repo.timeout_secs == 0 {
            anyhow::bail!("repository.timeout_secs must be > 0");
        }
    }

    if let Some(schedule) = &config.schedule {
        if schedule.interval_secs == 0 {
            anyhow::bail!("schedule.interval_secs must be > 0");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.store.backend, "file");
        assert_eq!(config.registry.backend, "docker");
        assert_eq!(config.registry.timeout_secs(), 300);
        assert_eq!(config.chart.timeout_secs, 10);
        assert_eq!(config.notify.backend, "log");
        assert!(config.repository.is_none());
        assert!(config.schedule.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
log_level = "debug"

[store]
backend = "s3"

[store.s3]
bucket = "homelab"
endpoint_url = "http://localhost:9000"

[repository]
url = "https://gitlab.example.com/ops/gitops.git"
local_path = "/var/lib/vk/gitops"
token_env = "GITOPS_TOKEN"
settle_secs = 0

[registry]
backend = "http"
insecure = ["localhost:5000"]

[schedule]
interval_secs = 600
auto_upgrade = true
"#,
        )
        .unwrap();

        let s3 = config.store.s3.unwrap();
        assert_eq!(s3.key, "deployments.json");
        assert_eq!(s3.region, "us-east-1");
        let repo = config.repository.unwrap();
        assert_eq!(repo.branch, "main");
        assert_eq!(repo.settle_secs, 0);
        assert_eq!(repo.timeout_secs, 300);
        assert_eq!(config.registry.timeout_secs(), 10);
        assert!(config.schedule.unwrap().auto_upgrade);
    }

    #[test]
    fn test_rejects_unknown_backends() {
        assert!(parse("[store]\nbackend = \"redis\"").is_err());
        assert!(parse("[registry]\nbackend = \"podman\"").is_err());
        assert!(parse("[notify]\nbackend = \"slack\"").is_err());
    }

    #[test]
    fn test_webhook_requires_url() {
        assert!(parse("[notify]\nbackend = \"webhook\"").is_err());
        assert!(parse("[notify]\nbackend = \"webhook\"\nwebhook_url = \"http://hook\"").is_ok());
    }

    #[test]
    fn test_s3_requires_section() {
        assert!(parse("[store]\nbackend = \"s3\"").is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(parse("[schedule]\ninterval_secs = 0").is_err());
    }
}
