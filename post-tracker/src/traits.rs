use crate::types::{Post, PostSource, ProxyEndpoint, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Durable record of post ids already delivered.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn has_seen(&self, post_id: &str) -> Result<bool>;

    /// Every id currently recorded.
    async fn seen_ids(&self) -> Result<HashSet<String>>;

    /// Idempotent bulk insert. Either every new id is durably recorded or
    /// none is.
    async fn record_seen(&self, post_ids: &[String]) -> Result<()>;

    /// Posts whose ids are not yet recorded, in input order.
    async fn filter_unseen(&self, posts: Vec<Post>) -> Result<Vec<Post>> {
        let seen = self.seen_ids().await?;
        Ok(posts.into_iter().filter(|post| !seen.contains(&post.id)).collect())
    }
}

/// Builds the post source the polling loop talks through, either direct or
/// relayed through a proxy.
pub trait SourceConnector: Send + Sync {
    fn connect(&self, proxy: Option<&ProxyEndpoint>) -> Result<Arc<dyn PostSource>>;
}
