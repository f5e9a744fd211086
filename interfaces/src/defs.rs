use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A tracked remote identity. The handle is what people type, the remote id
/// is what the post source understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub handle: String,
    pub remote_id: String,
}

impl Account {
    pub fn new(handle: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            remote_id: remote_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    #[default]
    Original,
    Repost,
    Quote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub kind: PostKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

impl Post {
    /// Calendar date (UTC) the post was created on.
    pub fn created_on(&self) -> NaiveDate {
        self.created_at.date_naive()
    }
}

// Collaborator note:
// The registry and the post source live outside the tracker. They are
// reached only through these traits and report failures as opaque errors;
// the tracker decides what a failure means for the current cycle.

#[async_trait]
pub trait AccountRegistry: Send + Sync {
    /// Remote ids of every tracked account, in registry order.
    async fn list_account_ids(&self) -> Result<Vec<String>>;

    async fn add(&self, handle: &str, remote_id: &str) -> Result<()>;

    async fn remove(&self, handle: &str) -> Result<()>;
}

#[async_trait]
pub trait PostSource: Send + Sync {
    /// Most recent posts of the account, newest first, at most `limit`.
    async fn fetch_recent(&self, remote_id: &str, limit: usize) -> Result<Vec<Post>>;

    /// Resolve a handle to the remote id posts are fetched by. Sources that
    /// cannot look handles up return `None`.
    async fn lookup_remote_id(&self, _handle: &str) -> Result<Option<String>> {
        Ok(None)
    }
}
