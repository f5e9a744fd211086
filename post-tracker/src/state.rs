use crate::traits::DedupStore;
use crate::types::{Account, AccountRegistry, Post, Result, TrackerError};
use crate::utils::write_atomic;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// On-disk layout of the state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub seen_posts: BTreeSet<String>,
}

/// File-backed tracked-account registry and dedup store.
///
/// The document is loaded once at open and rewritten whole on every
/// mutation (temp file, then rename). The in-memory copy only changes after
/// the write succeeded, so a failed write leaves both untouched.
pub struct JsonStore {
    path: PathBuf,
    state: Mutex<StateDocument>,
}

impl JsonStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                TrackerError::Storage(format!("corrupt state file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}, starting empty", path.display());
                StateDocument::default()
            }
            Err(e) => {
                return Err(TrackerError::Storage(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        info!(
            "Opened state file {} ({} accounts, {} seen posts)",
            path.display(),
            state.accounts.len(),
            state.seen_posts.len()
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accounts(&self) -> Vec<Account> {
        self.state.lock().await.accounts.clone()
    }

    pub async fn snapshot(&self) -> StateDocument {
        self.state.lock().await.clone()
    }

    pub async fn add_account(&self, handle: &str, remote_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.accounts.iter().any(|a| a.handle == handle) {
            return Err(TrackerError::DuplicateAccount {
                handle: handle.to_string(),
            });
        }

        let mut next = state.clone();
        next.accounts.push(Account::new(handle, remote_id));
        self.commit(&mut state, next).await?;

        info!("Tracking account {} ({})", handle, remote_id);
        Ok(())
    }

    pub async fn remove_account(&self, handle: &str) -> Result<Account> {
        let mut state = self.state.lock().await;
        let position = state
            .accounts
            .iter()
            .position(|a| a.handle == handle)
            .ok_or_else(|| TrackerError::UnknownAccount {
                handle: handle.to_string(),
            })?;

        let mut next = state.clone();
        let removed = next.accounts.remove(position);
        self.commit(&mut state, next).await?;

        info!("Stopped tracking account {}", handle);
        Ok(removed)
    }

    async fn commit(&self, current: &mut StateDocument, next: StateDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&next)?;
        write_atomic(&self.path, &bytes).await.map_err(|e| {
            TrackerError::Storage(format!("failed to write {}: {}", self.path.display(), e))
        })?;
        *current = next;
        Ok(())
    }
}

#[async_trait]
impl DedupStore for JsonStore {
    async fn has_seen(&self, post_id: &str) -> Result<bool> {
        Ok(self.state.lock().await.seen_posts.contains(post_id))
    }

    async fn seen_ids(&self) -> Result<HashSet<String>> {
        Ok(self.state.lock().await.seen_posts.iter().cloned().collect())
    }

    async fn record_seen(&self, post_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        let fresh: BTreeSet<&String> = post_ids
            .iter()
            .filter(|id| !state.seen_posts.contains(id.as_str()))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        let added = fresh.len();

        let mut next = state.clone();
        next.seen_posts.extend(fresh.into_iter().cloned());
        self.commit(&mut state, next).await?;

        debug!("Recorded {} new post ids", added);
        Ok(())
    }

    async fn filter_unseen(&self, posts: Vec<Post>) -> Result<Vec<Post>> {
        let state = self.state.lock().await;
        Ok(posts
            .into_iter()
            .filter(|post| !state.seen_posts.contains(&post.id))
            .collect())
    }
}

#[async_trait]
impl AccountRegistry for JsonStore {
    async fn list_account_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .await
            .accounts
            .iter()
            .map(|a| a.remote_id.clone())
            .collect())
    }

    async fn add(&self, handle: &str, remote_id: &str) -> anyhow::Result<()> {
        Ok(self.add_account(handle, remote_id).await?)
    }

    async fn remove(&self, handle: &str) -> anyhow::Result<()> {
        self.remove_account(handle).await?;
        Ok(())
    }
}
