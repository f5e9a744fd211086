pub mod config;
pub mod engine;
pub mod fetcher;
pub mod proxy;
pub mod state;
pub mod traits;
pub mod types;
pub mod utils;

pub use types::*;
pub use config::{HttpSourceConfig, PollConfig, ProbeConfig, TrackerConfig};
pub use engine::{delivery_fn, DeliveryCallback, PollingSession, SessionState};
pub use fetcher::{HttpConnector, HttpPostSource};
pub use proxy::{best_endpoint, load_proxy_file, parse_endpoint, save_proxy_file, ProxyValidator};
pub use state::JsonStore;
pub use traits::{DedupStore, SourceConnector};
