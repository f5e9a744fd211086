// Shared test doubles for the polling engine tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use post_tracker::engine::{delivery_fn, DeliveryCallback};
use post_tracker::{
    AccountRegistry, ConfigError, DedupStore, Post, PostKind, PostSource, ProxyEndpoint, Result, SourceConnector,
    TrackerError,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::sync::{mpsc, Notify};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn post_at(id: &str, created_at: DateTime<Utc>) -> Post {
    Post {
        id: id.to_string(),
        author: "alice".to_string(),
        body: format!("post {id}"),
        created_at,
        kind: PostKind::Original,
        media_url: None,
    }
}

pub fn today(id: &str) -> Post {
    post_at(id, Utc::now())
}

pub fn yesterday(id: &str) -> Post {
    post_at(id, Utc::now() - Duration::days(1))
}

pub fn ids(posts: &[Post]) -> Vec<&str> {
    posts.iter().map(|p| p.id.as_str()).collect()
}

/// Registry with a fixed, editable list of remote ids.
#[derive(Default)]
pub struct StaticRegistry {
    ids: Mutex<Vec<String>>,
}

impl StaticRegistry {
    pub fn with_ids(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            ids: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
        })
    }

    pub fn push(&self, id: &str) {
        self.ids.lock().unwrap().push(id.to_string());
    }
}

#[async_trait]
impl AccountRegistry for StaticRegistry {
    async fn list_account_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.ids.lock().unwrap().clone())
    }

    async fn add(&self, _handle: &str, remote_id: &str) -> anyhow::Result<()> {
        self.push(remote_id);
        Ok(())
    }

    async fn remove(&self, handle: &str) -> anyhow::Result<()> {
        self.ids.lock().unwrap().retain(|id| id != handle);
        Ok(())
    }
}

/// Post source answering from a per-account script. Accounts without a script
/// return no posts. One account may be gated so a test can hold a fetch open.
#[derive(Default)]
pub struct ScriptedSource {
    posts: Mutex<HashMap<String, Vec<Post>>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    gated: Mutex<Option<String>>,
    pub fetch_started: Notify,
    pub release: Notify,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_posts(&self, remote_id: &str, posts: Vec<Post>) {
        self.posts.lock().unwrap().insert(remote_id.to_string(), posts);
    }

    pub fn set_failing(&self, remote_id: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(remote_id.to_string());
        } else {
            set.remove(remote_id);
        }
    }

    pub fn gate(&self, remote_id: &str) {
        *self.gated.lock().unwrap() = Some(remote_id.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PostSource for ScriptedSource {
    async fn fetch_recent(&self, remote_id: &str, limit: usize) -> anyhow::Result<Vec<Post>> {
        self.calls.lock().unwrap().push(remote_id.to_string());

        let gated = self.gated.lock().unwrap().as_deref() == Some(remote_id);
        if gated {
            self.fetch_started.notify_one();
            self.release.notified().await;
        }

        if self.failing.lock().unwrap().contains(remote_id) {
            anyhow::bail!("connection reset fetching {remote_id}");
        }
        let mut posts = self.posts.lock().unwrap().get(remote_id).cloned().unwrap_or_default();
        posts.truncate(limit);
        Ok(posts)
    }
}

/// Connector handing out the same scripted source, remembering each
/// transport it was asked for.
pub struct ScriptedConnector {
    source: Arc<ScriptedSource>,
    connections: Mutex<Vec<Option<ProxyEndpoint>>>,
    refuse: AtomicBool,
}

impl ScriptedConnector {
    pub fn new(source: Arc<ScriptedSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            connections: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
        })
    }

    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Option<ProxyEndpoint>> {
        self.connections.lock().unwrap().clone()
    }
}

impl SourceConnector for ScriptedConnector {
    fn connect(&self, proxy: Option<&ProxyEndpoint>) -> Result<Arc<dyn PostSource>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ConfigError::Transport("missing credentials".to_string()).into());
        }
        self.connections.lock().unwrap().push(proxy.cloned());
        let source: Arc<dyn PostSource> = self.source.clone();
        Ok(source)
    }
}

/// In-memory dedup store whose writes can be made to fail.
#[derive(Default)]
pub struct MemoryDedup {
    seen: Mutex<HashSet<String>>,
    fail_writes: AtomicBool,
}

impl MemoryDedup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.lock().unwrap().contains(id)
    }
}

#[async_trait]
impl DedupStore for MemoryDedup {
    async fn has_seen(&self, post_id: &str) -> Result<bool> {
        Ok(self.contains(post_id))
    }

    async fn seen_ids(&self) -> Result<HashSet<String>> {
        Ok(self.seen.lock().unwrap().clone())
    }

    async fn record_seen(&self, post_ids: &[String]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TrackerError::Storage("disk full".to_string()));
        }
        self.seen.lock().unwrap().extend(post_ids.iter().cloned());
        Ok(())
    }
}

/// Delivery callback that forwards every batch to a channel.
pub fn channel_delivery() -> (DeliveryCallback, mpsc::UnboundedReceiver<Vec<Post>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let delivery = delivery_fn(move |posts| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(posts);
        }
    });
    (delivery, rx)
}

/// Drain whatever batches are already queued.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<Post>>) -> Vec<Vec<Post>> {
    let mut batches = Vec::new();
    while let Ok(batch) = rx.try_recv() {
        batches.push(batch);
    }
    batches
}
