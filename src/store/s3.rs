//! Catalog kept as a single object in an S3-compatible bucket.
//!
//! Requests are signed with AWS Signature V4 using `hmac` + `sha2`, so no
//! AWS SDK or C dependency is needed. Custom endpoints (MinIO, LocalStack)
//! are addressed path-style (`{endpoint}/{bucket}/{key}`); plain AWS uses
//! virtual-hosted style (`{bucket}.s3.{region}.amazonaws.com/{key}`).
//!
//! ```toml
//! [store]
//! backend = "s3"
//!
//! [store.s3]
//! bucket = "homelab"
//! key = "deployments.json"
//! endpoint_url = "http://minio.local:9000"
//! ```
//!
//! Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and,
//! optionally, `AWS_SESSION_TOKEN`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::{decode, delete, encode, upsert, DeploymentStore};
use crate::config::S3StoreConfig;
use crate::models::Deployment;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

pub struct S3Store {
    config: S3StoreConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
    lock: Mutex<()>,
}

impl S3Store {
    pub fn new(config: S3StoreConfig) -> Result<Self> {
        Self::with_credentials(config, AwsCredentials::from_env()?)
    }

    pub fn with_credentials(config: S3StoreConfig, creds: AwsCredentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            creds,
            client,
            lock: Mutex::new(()),
        })
    }

    async fn head_document(&self) -> Result<bool> {
        let target = object_target(&self.config)?;
        let headers = sign(
            &self.creds,
            &self.config.region,
            "HEAD",
            &target,
            &hex_sha256(b""),
            Utc::now(),
        )?;

        let mut req = self.client.head(&target.url);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await.with_context(|| {
            format!("Failed to stat s3://{}/{}", self.config.bucket, self.config.key)
        })?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => bail!("S3 HeadObject failed (HTTP {})", status),
        }
    }

    async fn get_document(&self) -> Result<Vec<Deployment>> {
        let target = object_target(&self.config)?;
        let headers = sign(
            &self.creds,
            &self.config.region,
            "GET",
            &target,
            &hex_sha256(b""),
            Utc::now(),
        )?;

        let mut req = self.client.get(&target.url);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await.with_context(|| {
            format!("Failed to get s3://{}/{}", self.config.bucket, self.config.key)
        })?;

        if resp.status() == StatusCode::NOT_FOUND {
            tracing::debug!(
                bucket = %self.config.bucket,
                key = %self.config.key,
                "catalog object not found, starting empty"
            );
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 GetObject failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }
        decode(&resp.text().await?)
    }

    async fn put_document(&self, deployments: &[Deployment]) -> Result<()> {
        let body = encode(deployments)?;
        let target = object_target(&self.config)?;
        let headers = sign(
            &self.creds,
            &self.config.region,
            "PUT",
            &target,
            &hex_sha256(body.as_bytes()),
            Utc::now(),
        )?;

        let mut req = self
            .client
            .put(&target.url)
            .header("content-type", "application/json")
            .body(body);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await.with_context(|| {
            format!("Failed to put s3://{}/{}", self.config.bucket, self.config.key)
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for S3Store {
    async fn load_all(&self) -> Result<Vec<Deployment>> {
        let _guard = self.lock.lock().await;
        self.get_document().await
    }

    async fn save(&self, deployment: &Deployment) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut all = self.get_document().await?;
        upsert(&mut all, deployment);
        self.put_document(&all).await
    }

    async fn remove(&self, app: &str, name: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut all = self.get_document().await?;
        if !delete(&mut all, app, name) {
            return Ok(false);
        }
        self.put_document(&all).await?;
        Ok(true)
    }

    async fn exists(&self) -> Result<bool> {
        self.head_document().await
    }

    async fn create(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.head_document().await? {
            return Ok(());
        }
        tracing::info!(
            bucket = %self.config.bucket,
            key = %self.config.key,
            "creating empty catalog object"
        );
        self.put_document(&[]).await
    }
}

// ============ Addressing ============

/// Where the catalog object lives: full URL plus the pieces SigV4 signs.
#[derive(Debug, PartialEq)]
struct ObjectTarget {
    url: String,
    host: String,
    canonical_uri: String,
}

fn object_target(config: &S3StoreConfig) -> Result<ObjectTarget> {
    let encoded_key = config
        .key
        .split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/");

    match &config.endpoint_url {
        Some(endpoint) => {
            let url = Url::parse(endpoint)
                .with_context(|| format!("Invalid store.s3.endpoint_url '{}'", endpoint))?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("store.s3.endpoint_url must be http(s), got '{}'", endpoint);
            }
            let name = url
                .host_str()
                .with_context(|| format!("store.s3.endpoint_url '{}' has no host", endpoint))?;
            // Default ports are left out, matching the Host header reqwest sends.
            let host = match url.port() {
                Some(port) => format!("{}:{}", name, port),
                None => name.to_string(),
            };
            let prefix = url.path().trim_end_matches('/');
            let canonical_uri =
                format!("{}/{}/{}", prefix, uri_encode(&config.bucket), encoded_key);
            Ok(ObjectTarget {
                url: format!("{}://{}{}", url.scheme(), host, canonical_uri),
                host,
                canonical_uri,
            })
        }
        None => {
            let host = format!("{}.s3.{}.amazonaws.com", config.bucket, config.region);
            let canonical_uri = format!("/{}", encoded_key);
            Ok(ObjectTarget {
                url: format!("https://{}{}", host, canonical_uri),
                host,
                canonical_uri,
            })
        }
    }
}

// ============ AWS SigV4 ============

/// Headers to attach to a request for `target`, including `Authorization`.
fn sign(
    creds: &AwsCredentials,
    region: &str,
    method: &str,
    target: &ObjectTarget,
    payload_hash: &str,
    at: DateTime<Utc>,
) -> Result<Vec<(String, String)>> {
    let date_stamp = at.format("%Y%m%d").to_string();
    let amz_date = at.format("%Y%m%dT%H%M%SZ").to_string();

    let mut headers = vec![
        ("host".to_string(), target.host.clone()),
        ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        method, target.canonical_uri, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3")?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    );

    // reqwest derives Host from the URL.
    headers.retain(|(k, _)| k != "host");
    headers.push(("authorization".to_string(), authorization));
    Ok(headers)
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).context("invalid HMAC key")?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}
