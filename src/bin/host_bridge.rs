//! Headless host bridge binary for stdin/stdout JSON communication.
//!
//! Reads `CommandEnvelope` messages as newline-delimited JSON from stdin and
//! writes `ResponseEnvelope` and `EventEnvelope` messages to stdout. All
//! tracing output goes to stderr so stdout stays a clean protocol channel.

use std::sync::Arc;
use tab_refresh::host::bridge_tabs::HostTabDirectory;
use tab_refresh::host::stdio::run_stdio_bridge;
use tab_refresh::scheduler::{SystemClock, TimerFacility, TokioTimerFacility};
use tab_refresh::store::{JsonFileStore, SettingsStore};
use tab_refresh::tabs::TabDirectory;
use tab_refresh::{RefreshService, RefresherConfig, ServiceDeps};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = RefresherConfig::default_config_path();
    let config = RefresherConfig::load_or_default(&config_path)
        .map_err(|e| anyhow::anyhow!("cannot load config {}: {e}", config_path.display()))?;
    config.validate()?;

    let store_path = config.store_path();
    let store = JsonFileStore::open(&store_path)?;
    tracing::info!(
        config = %config_path.display(),
        store = %store_path.display(),
        "tab-refresh-host starting"
    );

    let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
    let tabs = Arc::new(HostTabDirectory::with_timeout(
        event_tx.clone(),
        config.tab_call_timeout(),
    ));
    let (timers, fired_rx) = TokioTimerFacility::with_channel(Arc::new(SystemClock));
    let timers = Arc::new(timers);

    let service = RefreshService::new(
        config,
        ServiceDeps {
            tabs: Arc::clone(&tabs) as Arc<dyn TabDirectory>,
            timers: Arc::clone(&timers) as Arc<dyn TimerFacility>,
            clock: Arc::new(SystemClock),
            settings: SettingsStore::new(Arc::new(store)),
        },
    )
    .await?;
    let fire_loop = service.spawn_fire_loop(fired_rx);

    let result = run_stdio_bridge(service, tabs, event_tx).await;

    timers.clear_all();
    fire_loop.abort();

    result.map_err(|e| {
        tracing::error!(error = %e, "tab-refresh-host exited with error");
        anyhow::anyhow!("tab-refresh-host failed: {e}")
    })?;
    tracing::info!("tab-refresh-host shut down cleanly");
    Ok(())
}
