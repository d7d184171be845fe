//! Reload sources (spec §4.2 "Reload semantics"): a filesystem directory
//! (one file per logical module) or a list of HTTPS URLs with exponential
//! backoff, a payload size cap, and mandatory TLS verification.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::warn;

use super::rules::RawRuleDocument;

const REMOTE_BODY_CAP_BYTES: usize = 10 * 1024 * 1024;

#[async_trait::async_trait]
pub trait ReloadSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<RawRuleDocument>;
}

/// Reads every `*.toml` file in a directory and merges them into one
/// document.
pub struct FilesystemSource {
    dir: PathBuf,
}

impl FilesystemSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait::async_trait]
impl ReloadSource for FilesystemSource {
    async fn fetch(&self) -> anyhow::Result<RawRuleDocument> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("reading policy directory {}", self.dir.display()))?;

        let mut merged = RawRuleDocument::default();
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading policy file {}", path.display()))?;
            let doc: RawRuleDocument =
                toml::from_str(&content).with_context(|| format!("parsing policy file {}", path.display()))?;
            merged = merged.merge(doc);
        }

        Ok(merged)
    }
}

/// Fetches each configured URL over HTTPS with exponential backoff
/// (2s, 4s, 8s, 16s, ...) up to `retries` attempts, enforcing a size cap
/// and mandatory TLS verification (the default `reqwest` client verifies
/// certificates against the system trust store; it is never constructed
/// with `danger_accept_invalid_certs`).
pub struct RemoteSource {
    urls: Vec<String>,
    client: reqwest::Client,
    retries: u32,
}

impl RemoteSource {
    pub fn new(urls: Vec<String>, timeout: Duration, retries: u32) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { urls, client, retries })
    }

    async fn fetch_one(&self, url: &str) -> anyhow::Result<RawRuleDocument> {
        let mut attempt = 0;
        loop {
            match self.try_fetch_once(url).await {
                Ok(doc) => return Ok(doc),
                Err(e) if attempt < self.retries => {
                    let backoff = Duration::from_secs(2u64.pow(attempt + 1));
                    warn!(url, attempt, error = %e, "policy fetch failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_fetch_once(&self, url: &str) -> anyhow::Result<RawRuleDocument> {
        if !url.starts_with("https://") {
            bail!("policy url {url} must use https");
        }
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let bytes = resp.bytes().await?;
        if bytes.len() > REMOTE_BODY_CAP_BYTES {
            bail!("policy document at {url} exceeds size cap ({} bytes)", bytes.len());
        }
        let text = std::str::from_utf8(&bytes).with_context(|| format!("policy document at {url} is not utf-8"))?;
        toml::from_str(text).with_context(|| format!("parsing policy document at {url}"))
    }
}

#[async_trait::async_trait]
impl ReloadSource for RemoteSource {
    async fn fetch(&self) -> anyhow::Result<RawRuleDocument> {
        let mut merged = RawRuleDocument::default();
        for url in &self.urls {
            let doc = self.fetch_one(url).await?;
            merged = merged.merge(doc);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn filesystem_source_merges_multiple_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut f1 = std::fs::File::create(dir.path().join("a.toml")).unwrap();
        writeln!(f1, r#"bypass_domains = ["foo.example"]"#).unwrap();
        let mut f2 = std::fs::File::create(dir.path().join("b.toml")).unwrap();
        writeln!(
            f2,
            r#"
[[profiles]]
name = "kid"
default_action = "block"
"#
        )
        .unwrap();

        let source = FilesystemSource::new(dir.path());
        let doc = source.fetch().await.unwrap();
        assert_eq!(doc.bypass_domains, vec!["foo.example".to_string()]);
        assert_eq!(doc.profiles.len(), 1);
    }

    #[tokio::test]
    async fn remote_source_rejects_non_https_urls() {
        let source = RemoteSource::new(vec!["http://example.com/rules.toml".to_string()], Duration::from_secs(1), 0)
            .unwrap();
        let err = source.fetch().await.unwrap_err();
        assert!(err.to_string().contains("https"));
    }
}
