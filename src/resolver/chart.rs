//! Chart resolver: reads the newest chart version from a Helm repository
//! index (`{url}/index.yaml`, entries sorted newest first).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_yaml::Value;

use super::{Resolver, VersionCheck};
use crate::models::Source;

pub struct ChartResolver {
    client: reqwest::Client,
}

impl ChartResolver {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn fetch_index(&self, base_url: &str) -> Result<String> {
        let url = format!("{}/index.yaml", base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;
        if !resp.status().is_success() {
            bail!("GET {} failed (HTTP {})", url, resp.status());
        }
        let bytes = resp.bytes().await?;
        Ok(sanitize(&bytes))
    }
}

#[async_trait]
impl Resolver for ChartResolver {
    fn name(&self) -> &str {
        "chart"
    }

    async fn check(&self, source: &Source, known_version: &str) -> Result<VersionCheck> {
        let text = self.fetch_index(&source.base_url).await?;
        let latest = latest_chart_version(&text, &source.artifact)?;
        if latest == known_version {
            Ok(VersionCheck::Current)
        } else {
            Ok(VersionCheck::Newer(latest))
        }
    }
}

/// Keep printable ASCII and whitespace. Some published indexes carry stray
/// control or binary bytes that would otherwise break the YAML parser.
pub fn sanitize(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| *b as char)
        .filter(|c| {
            c.is_ascii_graphic() || matches!(*c, ' ' | '\t' | '\n' | '\r' | '\x0b' | '\x0c')
        })
        .collect()
}

/// `entries[chart][0].version` from an index document.
pub fn latest_chart_version(index: &str, chart: &str) -> Result<String> {
    let doc: Value = serde_yaml::from_str(index).context("Failed to parse chart index")?;
    let version = doc
        .get("entries")
        .and_then(|e| e.get(chart))
        .and_then(|list| list.get(0))
        .and_then(|entry| entry.get("version"))
        .with_context(|| format!("chart '{}' not found in index", chart))?;

    match version {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => bail!("chart '{}' has an unusable version: {:?}", chart, other),
    }
}
