use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use post_tracker::engine::delivery_fn;
use post_tracker::proxy::append_proxy;
use post_tracker::utils::extract_handle;
use post_tracker::{
    best_endpoint, load_proxy_file, parse_endpoint, save_proxy_file, CheckSummary, HttpConnector, JsonStore,
    PollingSession, PostSource, ProxyEndpoint, ProxyValidator, SourceConnector, TrackerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "post-tracker", about = "Watch tracked accounts for new posts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage tracked accounts
    Accounts {
        #[command(subcommand)]
        action: AccountAction,
    },
    /// Manage and validate the proxy list
    Proxies {
        #[command(subcommand)]
        action: ProxyAction,
    },
    /// Poll tracked accounts and print new posts as JSON lines
    Watch {
        /// Proxy to fetch through (host:port or host:port:user:pass)
        #[arg(long, conflicts_with = "best_proxy")]
        proxy: Option<String>,
        /// Check the proxy file and use the fastest working entry
        #[arg(long)]
        best_proxy: bool,
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
enum AccountAction {
    List,
    /// Track an account by handle or profile URL. Without a remote id the
    /// post source is asked to resolve it.
    Add { handle: String, remote_id: Option<String> },
    Remove { handle: String },
}

#[derive(Subcommand)]
enum ProxyAction {
    /// Validate a proxy line and append it to the proxy file
    Add { line: String },
    /// Probe every proxy in the file
    Check {
        /// Rewrite the proxy file with only the working proxies
        #[arg(long)]
        prune: bool,
        /// Write every result as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Per-proxy timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = TrackerConfig::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Command::Accounts { action } => accounts(&config, action).await,
        Command::Proxies { action } => proxies(&config, action).await,
        Command::Watch {
            proxy,
            best_proxy,
            once,
        } => watch(&config, proxy, best_proxy, once).await,
    }
}

fn handle_arg(input: &str) -> Result<String> {
    extract_handle(input).with_context(|| format!("'{input}' is not a handle or profile URL"))
}

async fn accounts(config: &TrackerConfig, action: AccountAction) -> Result<()> {
    let store = JsonStore::open(&config.state_path).await?;
    match action {
        AccountAction::List => {
            let accounts = store.accounts().await;
            if accounts.is_empty() {
                println!("No tracked accounts");
            }
            for account in accounts {
                println!("{}\t{}", account.handle, account.remote_id);
            }
        }
        AccountAction::Add { handle, remote_id } => {
            let handle = handle_arg(&handle)?;
            let remote_id = match remote_id {
                Some(remote_id) => remote_id,
                None => resolve_remote_id(config, &handle).await?,
            };
            store.add_account(&handle, &remote_id).await?;
            println!("Tracking {handle} ({remote_id})");
        }
        AccountAction::Remove { handle } => {
            let handle = handle_arg(&handle)?;
            store.remove_account(&handle).await?;
            println!("Removed {handle}");
        }
    }
    Ok(())
}

async fn resolve_remote_id(config: &TrackerConfig, handle: &str) -> Result<String> {
    let connector = HttpConnector::new(config.source.clone())
        .context("a remote id is required when SOURCE_BASE_URL is not set")?;
    let source = connector.connect(None)?;
    source
        .lookup_remote_id(handle)
        .await?
        .with_context(|| format!("could not resolve a remote id for {handle}"))
}

async fn proxies(config: &TrackerConfig, action: ProxyAction) -> Result<()> {
    match action {
        ProxyAction::Add { line } => {
            let (endpoint, added) = append_proxy(&config.proxies_path, &line).await?;
            if added {
                println!("Added {}", endpoint.redacted());
            } else {
                println!("{} is already listed", endpoint.redacted());
            }
        }
        ProxyAction::Check {
            prune,
            report,
            concurrency,
            timeout,
        } => {
            let mut probe = config.probe.clone();
            if let Some(timeout) = timeout {
                probe.timeout = Duration::from_secs(timeout);
            }
            if let Some(concurrency) = concurrency {
                probe.max_concurrency = concurrency;
            }
            probe.validate()?;

            let list = load_proxy_file(&config.proxies_path).await?;
            if list.endpoints.is_empty() {
                println!("No proxies found to check");
                return Ok(());
            }

            let validator = ProxyValidator::from_config(&probe)?;
            println!(
                "Checking {} proxies ({} at a time, {}s timeout)",
                list.endpoints.len(),
                probe.max_concurrency,
                validator.timeout().as_secs()
            );
            let started = Instant::now();
            let results = validator.check_many(list.endpoints, probe.max_concurrency).await;
            let summary = CheckSummary::from_results(&results, started.elapsed());

            println!("Completed in {:.2} seconds", summary.elapsed.as_secs_f64());
            println!(
                "Working proxies: {}/{} ({:.1}%)",
                summary.working,
                summary.total,
                summary.working_percent()
            );
            if let Some(avg) = summary.average_latency_ms {
                println!("Average response time: {:.0} ms", avg);
            }

            if let Some(path) = report {
                let json = serde_json::to_vec_pretty(&results)?;
                tokio::fs::write(&path, json)
                    .await
                    .with_context(|| format!("Failed to write report {}", path.display()))?;
                println!("Results saved to {}", path.display());
            }

            if prune {
                let working: Vec<ProxyEndpoint> =
                    results.iter().filter(|r| r.working).map(|r| r.endpoint.clone()).collect();
                save_proxy_file(&config.proxies_path, &working).await?;
            }
        }
    }
    Ok(())
}

/// Probe the candidate transport before adopting it.
async fn choose_proxy(config: &TrackerConfig, proxy: Option<String>, best: bool) -> Result<Option<ProxyEndpoint>> {
    let validator = ProxyValidator::from_config(&config.probe)?;

    if let Some(line) = proxy {
        let endpoint = parse_endpoint(&line)?;
        let result = validator.check_endpoint(&endpoint).await;
        if !result.working {
            bail!(
                "proxy {} failed its check: {}",
                endpoint.redacted(),
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        return Ok(Some(endpoint));
    }

    if best {
        let list = load_proxy_file(&config.proxies_path).await?;
        let results = validator.check_many(list.endpoints, config.probe.max_concurrency).await;
        let endpoint = best_endpoint(&results)
            .cloned()
            .context("no working proxy in the proxy file")?;
        info!("Using proxy {}", endpoint.redacted());
        return Ok(Some(endpoint));
    }

    Ok(None)
}

async fn watch(config: &TrackerConfig, proxy: Option<String>, best: bool, once: bool) -> Result<()> {
    let connector = HttpConnector::new(config.source.clone())?;
    let store = Arc::new(JsonStore::open(&config.state_path).await?);
    let session = PollingSession::new(store.clone(), store, Arc::new(connector), config.poll.clone());

    session.set_proxy(choose_proxy(config, proxy, best).await?);

    let delivery = delivery_fn(|posts| async move {
        for post in posts {
            match serde_json::to_string(&post) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Could not serialise post {}: {}", post.id, e),
            }
        }
    });

    if once {
        let report = session.poll_once(Some(delivery)).await?;
        info!(
            "Polled {} accounts ({} failed), {} new posts",
            report.accounts_polled, report.accounts_failed, report.posts_delivered
        );
        return Ok(());
    }

    session.activate(Some(delivery)).await?;
    info!("Watching tracked accounts every {:?}; Ctrl-C to stop", session.interval());
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    session.stop();
    session.wait_idle().await;
    Ok(())
}
