use crate::config::PollConfig;
use crate::traits::{DedupStore, SourceConnector};
use crate::types::{AccountRegistry, CycleReport, Post, PostSource, ProxyEndpoint, Result, TrackerError};
use crate::utils::is_fresh;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Receives each account's newly seen posts. Awaited before the next account
/// is polled.
pub type DeliveryCallback = Arc<dyn Fn(Vec<Post>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`DeliveryCallback`].
pub fn delivery_fn<F, Fut>(f: F) -> DeliveryCallback
where
    F: Fn(Vec<Post>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |posts| f(posts).boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
}

struct RunHandle {
    run_id: Uuid,
    token: CancellationToken,
    finished: Shared<BoxFuture<'static, ()>>,
}

#[derive(Default)]
struct SessionInner {
    active: bool,
    // Set while an activate call waits for the previous loop; a stop clears it.
    activating: bool,
    transport_proxy: Option<ProxyEndpoint>,
    run: Option<RunHandle>,
}

/// The polling engine: owns the Idle/Active lifecycle and at most one
/// background loop that walks the tracked accounts every interval.
///
/// `stop` and `set_proxy` may be called from any task while a cycle runs;
/// they take effect at the next account boundary.
pub struct PollingSession {
    registry: Arc<dyn AccountRegistry>,
    dedup: Arc<dyn DedupStore>,
    connector: Arc<dyn SourceConnector>,
    config: PollConfig,
    inner: Mutex<SessionInner>,
    // Serialises activate/poll_once so two callers can't both start a loop.
    transitions: tokio::sync::Mutex<()>,
}

impl PollingSession {
    pub fn new(
        registry: Arc<dyn AccountRegistry>,
        dedup: Arc<dyn DedupStore>,
        connector: Arc<dyn SourceConnector>,
        config: PollConfig,
    ) -> Self {
        Self {
            registry,
            dedup,
            connector,
            config,
            inner: Mutex::new(SessionInner::default()),
            transitions: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn state(&self) -> SessionState {
        if self.is_active() {
            SessionState::Active
        } else {
            SessionState::Idle
        }
    }

    pub fn proxy(&self) -> Option<ProxyEndpoint> {
        self.lock().transport_proxy.clone()
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Idle -> Active. Builds the transport from the configured proxy and
    /// spawns the polling loop. Calling it on an active session is a no-op.
    ///
    /// A `stop` or `set_proxy` that lands while this call is still waiting
    /// for a previous loop to exit wins: the session is left idle.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Config`] when the poll settings are invalid or
    /// the transport cannot be built; the session stays idle.
    pub async fn activate(&self, delivery: Option<DeliveryCallback>) -> Result<()> {
        let _transition = self.transitions.lock().await;

        let previous = {
            let mut inner = self.lock();
            if inner.active {
                debug!("Polling session already active");
                return Ok(());
            }
            inner.activating = true;
            inner.run.take()
        };
        // A stopped loop may still be finishing its in-flight account.
        if let Some(previous) = previous {
            previous.finished.await;
        }

        // Held until the run is published so stop and set_proxy cannot slip
        // in between reading the proxy and marking the session active.
        let mut inner = self.lock();
        if !std::mem::take(&mut inner.activating) {
            info!("Activation withdrawn by a stop request");
            return Ok(());
        }

        self.config.validate()?;
        let source = self.connector.connect(inner.transport_proxy.as_ref())?;

        let run_id = Uuid::new_v4();
        let token = CancellationToken::new();
        let cycle = Cycle {
            registry: self.registry.clone(),
            dedup: self.dedup.clone(),
            source,
            delivery,
            posts_per_account: self.config.posts_per_account,
        };

        let span = info_span!("poll_loop", run_id = %run_id);
        let handle = tokio::spawn(run_loop(cycle, token.clone(), self.config.interval).instrument(span));
        let finished = handle.map(|_| ()).boxed().shared();

        inner.active = true;
        inner.run = Some(RunHandle {
            run_id,
            token,
            finished,
        });

        info!(
            "Polling session {} activated ({})",
            run_id,
            inner
                .transport_proxy
                .as_ref()
                .map(|p| p.redacted())
                .unwrap_or_else(|| "direct".to_string())
        );
        Ok(())
    }

    /// Active -> Idle. Returns at once; the loop notices at its next account
    /// boundary or wakes from its sleep. A fetch already in flight is allowed
    /// to finish.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if std::mem::take(&mut inner.activating) {
            debug!("Pending activation cancelled");
        }
        if !inner.active {
            return;
        }
        inner.active = false;
        if let Some(run) = &inner.run {
            run.token.cancel();
            info!("Polling session {} stopping", run.run_id);
        }
    }

    /// Stop the session and switch its transport. The session is left idle;
    /// the caller re-activates it when ready.
    pub fn set_proxy(&self, proxy: Option<ProxyEndpoint>) {
        self.stop();
        let mut inner = self.lock();
        info!(
            "Transport set to {}",
            proxy.as_ref().map(|p| p.redacted()).unwrap_or_else(|| "direct".to_string())
        );
        inner.transport_proxy = proxy;
    }

    /// Wait until the background loop, if any, has exited. Only returns
    /// after a `stop`.
    pub async fn wait_idle(&self) {
        let finished = self.lock().run.as_ref().map(|run| run.finished.clone());
        if let Some(finished) = finished {
            finished.await;
        }
    }

    /// Run exactly one cycle on the caller's task using the configured
    /// transport.
    ///
    /// # Errors
    ///
    /// [`TrackerError::SessionActive`] if the background loop is running, or
    /// [`TrackerError::Config`] if the transport cannot be built.
    pub async fn poll_once(&self, delivery: Option<DeliveryCallback>) -> Result<CycleReport> {
        let _transition = self.transitions.lock().await;
        if self.is_active() {
            return Err(TrackerError::SessionActive);
        }
        self.wait_idle().await;

        self.config.validate()?;
        let proxy = self.proxy();
        let source = self.connector.connect(proxy.as_ref())?;
        let cycle = Cycle {
            registry: self.registry.clone(),
            dedup: self.dedup.clone(),
            source,
            delivery,
            posts_per_account: self.config.posts_per_account,
        };

        Ok(cycle.run(&CancellationToken::new()).await)
    }
}

impl Drop for PollingSession {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(cycle: Cycle, token: CancellationToken, interval: Duration) {
    info!("Polling loop started (every {:?})", interval);
    while !token.is_cancelled() {
        let report = cycle.run(&token).await;
        info!(
            polled = report.accounts_polled,
            failed = report.accounts_failed,
            delivered = report.posts_delivered,
            "Cycle finished"
        );

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("Polling loop stopped");
}

/// Everything one pass over the accounts needs. Accounts are visited one at a
/// time, in registry order.
struct Cycle {
    registry: Arc<dyn AccountRegistry>,
    dedup: Arc<dyn DedupStore>,
    source: Arc<dyn PostSource>,
    delivery: Option<DeliveryCallback>,
    posts_per_account: usize,
}

impl Cycle {
    async fn run(&self, token: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();

        // Snapshot taken once: accounts added or removed now count from the
        // next cycle.
        let account_ids = match self.registry.list_account_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!("{}", TrackerError::storage(format!("could not list accounts: {e:#}")));
                return report;
            }
        };

        for remote_id in account_ids {
            if token.is_cancelled() {
                report.interrupted = true;
                break;
            }
            match self.poll_account(&remote_id).await {
                Ok(count) => {
                    report.accounts_polled += 1;
                    report.posts_delivered += count;
                }
                Err(e) => {
                    report.accounts_failed += 1;
                    warn!(account = %remote_id, "Skipping account this cycle: {}", e);
                }
            }
        }

        report
    }

    /// Fetch, keep today's unseen posts, record them, then deliver. Nothing is
    /// recorded when the fetch or the store fails, so the posts come back next
    /// cycle.
    async fn poll_account(&self, remote_id: &str) -> Result<usize> {
        let posts = self
            .source
            .fetch_recent(remote_id, self.posts_per_account)
            .await
            .map_err(TrackerError::transport)?;
        let fetched = posts.len();

        let now = Utc::now();
        let mut ids_in_batch = HashSet::new();
        let fresh: Vec<Post> = posts
            .into_iter()
            .filter(|post| is_fresh(post, now))
            .filter(|post| ids_in_batch.insert(post.id.clone()))
            .collect();
        if fresh.is_empty() {
            debug!(account = %remote_id, "No posts from today ({} fetched)", fetched);
            return Ok(0);
        }

        let unseen = self.dedup.filter_unseen(fresh).await?;
        if unseen.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = unseen.iter().map(|post| post.id.clone()).collect();
        self.dedup.record_seen(&ids).await?;

        let count = unseen.len();
        info!(account = %remote_id, "{} new posts", count);
        match &self.delivery {
            Some(deliver) => deliver(unseen).await,
            None => debug!("No delivery configured; posts recorded only"),
        }
        Ok(count)
    }
}
