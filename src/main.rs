use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use modelsock::api::{AppState, app_router};
use modelsock::config::AppConfig;
use modelsock::proxy::{UnixUpstream, Upstream};
use modelsock::registry::RegistryClient;
use modelsock::rules::RuleTable;
use modelsock::server;
use modelsock::store::{ModelStore, OllamaStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    Registry::default()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();

    // Load configuration
    let config = AppConfig::load()?;
    info!("Loaded configuration: {:?}", config);

    let registry = RegistryClient::new(config.store.insecure);
    let store: Arc<dyn ModelStore> = Arc::new(OllamaStore::new(
        config.store.root.clone(),
        registry,
        config.store.registry_host.clone(),
    ));
    let upstream: Arc<dyn Upstream> =
        Arc::new(UnixUpstream::new(config.upstream.socket.clone()));

    let app = app_router(AppState {
        rules: Arc::new(RuleTable::new()),
        store,
        upstream,
    });

    info!(
        upstream = %config.upstream.socket.display(),
        store_root = %config.store.root.display(),
        "starting modelsockd"
    );
    server::serve(&config.socket, app).await
}
