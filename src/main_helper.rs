use crate::config::RelayConfig;
use crate::hardening::RetryPolicy;
use crate::registry::ModelRegistry;
use crate::relay::CompletionRelay;
use crate::store::SessionStore;
use crate::types::*;
use crate::upstream::UpstreamClient;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// JSON model configuration.
    #[arg(long, default_value = "relay_config.json")]
    pub config: PathBuf,
    /// One JSON file per session lives here.
    #[arg(long, default_value = "chat_history")]
    pub data_dir: PathBuf,
    /// Serve the chat UI from this directory.
    #[arg(long)]
    pub static_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated between two upstream lines.
    #[arg(long, default_value_t = 120)]
    pub chunk_timeout_secs: u64,
    /// Whole-request upstream timeout. Unset means none.
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_size: usize,
    /// Attempts at opening an upstream request, including the first.
    #[arg(long, default_value_t = 1)]
    pub max_retries: u32,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self::parse_from(["chat-relay"])
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub registry: Arc<ModelRegistry>,
    pub relay: Arc<CompletionRelay>,
    pub upstream: UpstreamClient,
    pub args: Arc<Args>,
    pub health: Arc<UpstreamHealth>,
}

impl AppState {
    /// Loads config and sessions, then wires the relay. Any error is fatal at startup.
    pub async fn from_args(args: Args) -> Result<Self> {
        let config = RelayConfig::load(&args.config)?;
        let registry = ModelRegistry::from_config(&config)?;
        let store = SessionStore::open(args.data_dir.clone()).await?;
        let upstream = UpstreamClient::new(
            Duration::from_secs(args.connect_timeout_secs),
            args.request_timeout_secs.map(Duration::from_secs),
        )?;
        Ok(Self::build(args, registry, store, upstream))
    }

    pub fn build(
        args: Args,
        registry: ModelRegistry,
        store: SessionStore,
        upstream: UpstreamClient,
    ) -> Self {
        let store = Arc::new(store);
        let registry = Arc::new(registry);
        let health = Arc::new(UpstreamHealth::default());

        let relay = CompletionRelay::new(
            store.clone(),
            registry.clone(),
            upstream.clone(),
            health.clone(),
        )
        .with_retry_policy(RetryPolicy::new(args.max_retries, 100))
        .with_chunk_timeout(Duration::from_secs(args.chunk_timeout_secs));

        Self {
            store,
            registry,
            relay: Arc::new(relay),
            upstream,
            args: Arc::new(args),
            health,
        }
    }
}
