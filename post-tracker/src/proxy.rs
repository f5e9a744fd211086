use crate::config::ProbeConfig;
use crate::types::{ParseError, ParseErrorKind, ProxyCheckResult, ProxyEndpoint, Result, TrackerError};
use crate::utils::write_atomic;
use chrono::Utc;
use reqwest::{Client, ClientBuilder, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

/// Parse one proxy line: `host:port` or `host:port:username:password`.
pub fn parse_endpoint(line: &str) -> std::result::Result<ProxyEndpoint, ParseError> {
    let line = line.trim();
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() != 2 && fields.len() != 4 {
        return Err(ParseError::new(ParseErrorKind::FieldCount, redact_line(line)));
    }

    let host = fields[0];
    if !is_valid_host(host) {
        return Err(ParseError::new(ParseErrorKind::InvalidHost, redact_line(line)));
    }

    let port = match fields[1].parse::<u16>() {
        Ok(port) if port != 0 => port,
        _ => return Err(ParseError::new(ParseErrorKind::InvalidPort, redact_line(line))),
    };

    let endpoint = ProxyEndpoint::new(host, port);
    if fields.len() == 2 {
        return Ok(endpoint);
    }

    let (username, password) = (fields[2], fields[3]);
    if username.is_empty() || password.is_empty() {
        return Err(ParseError::new(ParseErrorKind::EmptyCredential, redact_line(line)));
    }
    Ok(endpoint.with_credentials(username, password))
}

impl FromStr for ProxyEndpoint {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        parse_endpoint(s)
    }
}

/// Loose syntax check: dotted-quad IPv4, or a hostname made of
/// alphanumeric/hyphen labels.
fn is_valid_host(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return host.parse::<Ipv4Addr>().is_ok();
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

// Keep the password out of error messages and logs.
fn redact_line(line: &str) -> String {
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() >= 4 {
        format!("{}:***", fields[..3].join(":"))
    } else {
        line.to_string()
    }
}

/// Endpoints read from a proxy list file, plus the lines that were rejected.
#[derive(Debug, Default)]
pub struct ProxyList {
    pub endpoints: Vec<ProxyEndpoint>,
    pub rejected: Vec<(usize, ParseError)>,
}

pub fn parse_proxy_list(content: &str) -> ProxyList {
    let mut list = ProxyList::default();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_endpoint(line) {
            Ok(endpoint) => list.endpoints.push(endpoint),
            Err(e) => list.rejected.push((index + 1, e)),
        }
    }
    list
}

/// Load a proxy list file. A missing file is an empty list.
pub async fn load_proxy_file(path: &Path) -> Result<ProxyList> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Proxy file {} not found", path.display());
            return Ok(ProxyList::default());
        }
        Err(e) => return Err(TrackerError::storage(e)),
    };

    let list = parse_proxy_list(&content);
    for (line_no, err) in &list.rejected {
        warn!("Skipping invalid proxy on line {}: {}", line_no, err);
    }
    info!("Loaded {} proxies from {}", list.endpoints.len(), path.display());
    Ok(list)
}

/// Rewrite the proxy file with exactly `endpoints`, one per line.
pub async fn save_proxy_file(path: &Path, endpoints: &[ProxyEndpoint]) -> Result<()> {
    let mut content = String::new();
    for endpoint in endpoints {
        content.push_str(&endpoint.to_string());
        content.push('\n');
    }
    write_atomic(path, content.as_bytes())
        .await
        .map_err(TrackerError::storage)?;
    info!("Saved {} proxies to {}", endpoints.len(), path.display());
    Ok(())
}

/// Validate `line` and append it to the proxy file unless already listed.
/// Returns the endpoint and whether it was newly added.
pub async fn append_proxy(path: &Path, line: &str) -> Result<(ProxyEndpoint, bool)> {
    let endpoint = parse_endpoint(line)?;

    let existing = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(TrackerError::storage(e)),
    };
    if parse_proxy_list(&existing).endpoints.contains(&endpoint) {
        debug!("Proxy {} already listed", endpoint.redacted());
        return Ok((endpoint, false));
    }

    let mut entry = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        entry.push('\n');
    }
    entry.push_str(&endpoint.to_string());
    entry.push('\n');

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(TrackerError::storage)?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(TrackerError::storage)?;
    file.write_all(entry.as_bytes()).await.map_err(TrackerError::storage)?;
    file.sync_all().await.map_err(TrackerError::storage)?;

    info!("Added proxy {}", endpoint.redacted());
    Ok((endpoint, true))
}

/// Route every request of `builder` through `proxy`, or connect directly when
/// there is none.
pub fn apply_proxy(builder: ClientBuilder, proxy: Option<&ProxyEndpoint>) -> reqwest::Result<ClientBuilder> {
    match proxy {
        Some(endpoint) => {
            let mut relay = reqwest::Proxy::all(endpoint.proxy_url())?;
            if let Some((username, password)) = endpoint.credentials() {
                relay = relay.basic_auth(username, password);
            }
            Ok(builder.proxy(relay))
        }
        None => Ok(builder.no_proxy()),
    }
}

/// Working endpoint with the lowest measured latency.
pub fn best_endpoint(results: &[ProxyCheckResult]) -> Option<&ProxyEndpoint> {
    results
        .iter()
        .filter(|r| r.working)
        .min_by(|a, b| {
            let a = a.latency_ms.unwrap_or(f64::MAX);
            let b = b.latency_ms.unwrap_or(f64::MAX);
            a.total_cmp(&b)
        })
        .map(|r| &r.endpoint)
}

/// Live reachability probe for proxies.
#[derive(Debug, Clone)]
pub struct ProxyValidator {
    probe_url: String,
    timeout: Duration,
    user_agent: String,
}

impl ProxyValidator {
    pub fn new(probe_url: &str, timeout: Duration) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            probe_url: parse_probe_url(probe_url)?,
            timeout,
            user_agent: ProbeConfig::default().user_agent,
        })
    }

    pub fn from_config(config: &ProbeConfig) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            probe_url: parse_probe_url(&config.probe_url)?,
            timeout: config.timeout,
            user_agent: config.user_agent.clone(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn client_for(&self, endpoint: &ProxyEndpoint) -> reqwest::Result<Client> {
        let builder = Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0);
        apply_proxy(builder, Some(endpoint))?.build()
    }

    /// One GET of the probe url through `endpoint`. Never fails: every
    /// problem is reported in the result.
    pub async fn check_endpoint(&self, endpoint: &ProxyEndpoint) -> ProxyCheckResult {
        let checked_at = Utc::now();
        let mut result = ProxyCheckResult {
            endpoint: endpoint.clone(),
            working: false,
            latency_ms: None,
            observed_external_ip: None,
            error: None,
            checked_at,
        };

        let client = match self.client_for(endpoint) {
            Ok(client) => client,
            Err(e) => {
                debug!("Could not build client for {}: {}", endpoint.redacted(), e);
                result.error = Some("connect failed".to_string());
                return result;
            }
        };

        let started = Instant::now();
        let request = async {
            let response = client.get(&self.probe_url).send().await?;
            let status = response.status();
            let body = if status.is_success() {
                response.text().await.ok()
            } else {
                None
            };
            Ok::<(StatusCode, Option<String>), reqwest::Error>((status, body))
        };

        match tokio::time::timeout(self.timeout, request).await {
            Err(_) => {
                result.error = Some("timeout".to_string());
            }
            Ok(Err(e)) => {
                debug!("Probe through {} failed: {}", endpoint.redacted(), e);
                result.error = Some(classify_error(&e).to_string());
            }
            Ok(Ok((status, body))) => {
                result.latency_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
                if status.is_success() {
                    result.working = true;
                    result.observed_external_ip = body.as_deref().and_then(parse_external_ip);
                } else {
                    result.error = Some(format!("status {}", status.as_u16()));
                }
            }
        }

        debug!(
            proxy = %endpoint.redacted(),
            working = result.working,
            latency_ms = ?result.latency_ms,
            "Proxy checked"
        );
        result
    }

    /// Check every endpoint with at most `max_concurrency` probes in flight.
    /// Each input yields exactly one result; order is completion order.
    pub async fn check_many(&self, endpoints: Vec<ProxyEndpoint>, max_concurrency: usize) -> Vec<ProxyCheckResult> {
        info!(
            "Checking {} proxies ({} at a time)",
            endpoints.len(),
            max_concurrency.max(1)
        );
        let validator = self.clone();
        run_bounded(
            endpoints,
            max_concurrency,
            move |endpoint: ProxyEndpoint| {
                let validator = validator.clone();
                async move { validator.check_endpoint(&endpoint).await }
            },
            |endpoint| ProxyCheckResult {
                endpoint,
                working: false,
                latency_ms: None,
                observed_external_ip: None,
                error: Some("probe task failed".to_string()),
                checked_at: Utc::now(),
            },
        )
        .await
    }
}

fn parse_probe_url(raw: &str) -> std::result::Result<String, ParseError> {
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url.to_string()),
        _ => Err(ParseError::new(ParseErrorKind::InvalidUrl, raw)),
    }
}

// Connection and DNS failures take priority over timeouts. Anything else
// that stops the request short of a response (protocol, body) counts as the
// relay failing to carry it.
fn classify_error(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() && !err.is_connect() {
        "timeout"
    } else {
        "connect failed"
    }
}

/// Pull the caller's public address out of a probe response. Understands
/// `{"origin": ".."}`, `{"ip": ".."}` and a bare address.
pub fn parse_external_ip(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let field = value
            .get("origin")
            .or_else(|| value.get("ip"))
            .and_then(|v| v.as_str())?;
        // httpbin lists every hop; the first one is the client
        let first = field.split(',').next()?.trim();
        return (!first.is_empty()).then(|| first.to_string());
    }

    let trimmed = body.trim();
    trimmed.parse::<IpAddr>().ok().map(|_| trimmed.to_string())
}

/// Run `task` over `items` on a semaphore-bounded set of tokio tasks.
///
/// Every item produces one output; a task that panics is replaced by
/// `on_failure(item)`.
pub async fn run_bounded<T, R, F, Fut, E>(items: Vec<T>, max_concurrency: usize, task: F, on_failure: E) -> Vec<R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
    E: Fn(T) -> R,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut set = JoinSet::new();
    let mut pending = HashMap::with_capacity(items.len());

    for item in items {
        let semaphore = semaphore.clone();
        let work = task(item.clone());
        let handle = set.spawn(async move {
            // The semaphore is never closed, so acquire only fails on a bug.
            let _permit = semaphore.acquire_owned().await;
            work.await
        });
        pending.insert(handle.id(), item);
    }

    let mut results = Vec::with_capacity(pending.len());
    while let Some(joined) = set.join_next_with_id().await {
        match joined {
            Ok((id, output)) => {
                pending.remove(&id);
                results.push(output);
            }
            Err(e) => {
                warn!("Bounded task failed: {}", e);
                if let Some(item) = pending.remove(&e.id()) {
                    results.push(on_failure(item));
                }
            }
        }
    }
    results
}
