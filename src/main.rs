//! loggy-server: binds the analysis pipeline behind the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use loggy_core::backend::{BackendRouter, FileBackend, RemoteBackend, RemoteBackendConfig};
use loggy_core::cache::{L2Tier, LlmCacheGateway, LogSearchCache, RedisStore};
use loggy_core::config::AppConfig;
use loggy_core::error::Result;
use loggy_core::http::{serve, AppState};
use loggy_core::llm::build_provider;
use loggy_core::pipeline::{Pipeline, PipelineConfig};
use loggy_core::session::{SessionConfig, SessionRegistry};
use loggy_core::store::{ConfigStore, SqliteConfigStore};
use loggy_core::AgentContext;

async fn l2_tier(enabled: bool, url: Option<&str>) -> L2Tier {
    match (enabled, url) {
        (true, Some(url)) => match RedisStore::connect(url).await {
            Ok(store) => L2Tier::new(Some(Arc::new(store))),
            Err(err) => {
                warn!(error = %err, "L2 store unreachable at startup, running L1-only");
                L2Tier::disabled()
            }
        },
        _ => L2Tier::disabled(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loggy_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    config.validate()?;
    info!(bind_addr = %config.bind_addr, "starting loggy-server");

    // Dynamic configuration store; DB trouble degrades to compiled-in defaults.
    let db = match SqliteConfigStore::open(&config.database_url) {
        Ok(db) => Some(Arc::new(db)),
        Err(err) => {
            warn!(error = %err, "config database unavailable, using compiled-in defaults");
            None
        }
    };
    let store = Arc::new(ConfigStore::new(db, config.flags.clone()));

    // LLM gateway and provider.
    let llm_l2 = l2_tier(
        config.llm_cache.l2_enabled,
        config.llm_cache.l2_url.as_deref(),
    )
    .await;
    let gateway = Arc::new(LlmCacheGateway::new(config.llm_cache.clone(), llm_l2));
    let provider = build_provider(&config)?;

    // Log backends behind the routing factory.
    let log_l2 = l2_tier(config.log_cache.l2_url.is_some(), config.log_cache.l2_url.as_deref()).await;
    let log_cache = LogSearchCache::new(config.log_cache.clone(), log_l2);
    let exclude_labels: Vec<(String, String)> = store
        .get_list("search", "exclude_labels", &[])
        .await
        .iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(label, value)| (label.to_string(), value.to_string()))
        })
        .collect();
    let mut remote_config = RemoteBackendConfig::new(
        config
            .log_backend_url
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:3100".to_string()),
        config.max_log_bytes,
    );
    remote_config.token = config.log_backend_token.clone();
    remote_config.exclude_labels = exclude_labels;
    let backends = BackendRouter::new(
        Arc::new(FileBackend::new(config.max_log_bytes)),
        Arc::new(RemoteBackend::new(remote_config, log_cache)?),
    );

    let pipeline = Arc::new(Pipeline {
        agents: AgentContext {
            provider,
            gateway: Arc::clone(&gateway),
            store: Arc::clone(&store),
        },
        backends,
        analysis_dir: config.analysis_dir.clone(),
        max_log_bytes: config.max_log_bytes,
        config: PipelineConfig::default(),
    });

    let registry = SessionRegistry::new(SessionConfig {
        session_timeout: Duration::from_secs(config.session_timeout_seconds),
        ..SessionConfig::default()
    });

    let state = Arc::new(AppState {
        pipeline,
        registry,
        gateway,
        analysis_dir: config.analysis_dir,
    });

    serve(&config.bind_addr, state).await
}
