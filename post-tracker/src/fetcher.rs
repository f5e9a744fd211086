use crate::config::{ConfigError, HttpSourceConfig};
use crate::proxy::apply_proxy;
use crate::traits::SourceConnector;
use crate::types::{Post, PostSource, ProxyEndpoint, Result};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Post source backed by a JSON HTTP API:
/// `GET {base_url}/users/{remote_id}/posts?limit={n}` returns an array of posts.
pub struct HttpPostSource {
    client: Client,
    base_url: Url,
}

impl HttpPostSource {
    pub fn new(config: &HttpSourceConfig, base_url: Url, proxy: Option<&ProxyEndpoint>) -> reqwest::Result<Self> {
        let builder = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .gzip(true)
            .deflate(true)
            .brotli(true);
        let client = apply_proxy(builder, proxy)?.build()?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("base url {} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn posts_url(&self, remote_id: &str, limit: usize) -> anyhow::Result<Url> {
        let mut url = self.endpoint(&["users", remote_id, "posts"])?;
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        Ok(url)
    }
}

#[derive(Deserialize)]
struct UserLookup {
    id: String,
}

#[async_trait]
impl PostSource for HttpPostSource {
    async fn fetch_recent(&self, remote_id: &str, limit: usize) -> anyhow::Result<Vec<Post>> {
        let url = self.posts_url(remote_id, limit)?;
        debug!("Fetching posts: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request for account {} failed", remote_id))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            );
        }

        let mut posts: Vec<Post> = response
            .json()
            .await
            .with_context(|| format!("malformed posts payload for account {}", remote_id))?;
        posts.truncate(limit);
        Ok(posts)
    }

    /// `GET {base_url}/users/by/username/{handle}` answering `{"id": ".."}`;
    /// 404 means no such account.
    async fn lookup_remote_id(&self, handle: &str) -> anyhow::Result<Option<String>> {
        let url = self.endpoint(&["users", "by", "username", handle])?;
        debug!("Looking up account: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("lookup of {} failed", handle))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            anyhow::bail!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            );
        }

        let user: UserLookup = response
            .json()
            .await
            .with_context(|| format!("malformed lookup payload for {}", handle))?;
        Ok(Some(user.id))
    }
}

/// Builds an [`HttpPostSource`] for whatever transport the session is
/// configured with.
pub struct HttpConnector {
    config: HttpSourceConfig,
    base_url: Url,
}

impl HttpConnector {
    pub fn new(config: HttpSourceConfig) -> std::result::Result<Self, ConfigError> {
        let base_url = config.require_base_url()?;
        Ok(Self { config, base_url })
    }
}

impl SourceConnector for HttpConnector {
    fn connect(&self, proxy: Option<&ProxyEndpoint>) -> Result<Arc<dyn PostSource>> {
        let source = HttpPostSource::new(&self.config, self.base_url.clone(), proxy)
            .map_err(|e| ConfigError::Transport(e.to_string()))?;
        Ok(Arc::new(source))
    }
}
