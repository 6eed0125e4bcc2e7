//! Binary entry point: wire the store, engine, and control API together.

use anyhow::Context;

use zdmr::paths::AppPaths;
use zdmr::{BandwidthLimiter, Database, Engine, EventHub, Store, Transport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let paths = AppPaths::resolve().context("failed to resolve app data dir")?;
    zdmr::logging::init(&paths.logs_dir);

    tracing::info!(data_dir = %paths.data_dir.display(), "starting z-dmr");

    let db = Database::open(&paths.db_path)
        .await
        .context("failed to open database")?;
    let store = Store::new(db);

    store
        .ensure_bootstrap_defaults(&paths.default_download_dir())
        .await
        .context("failed to bootstrap settings")?;

    // Anything left mid-transfer by a crash goes back into the queue with
    // its byte counters intact.
    let recovered = store
        .recover_unfinished()
        .await
        .context("crash recovery failed")?;
    if recovered > 0 {
        tracing::info!(recovered, "requeued unfinished downloads");
    }

    let settings = store.settings_snapshot().await?;
    let limiter = BandwidthLimiter::new(settings.bandwidth_limit_bps);
    let transport = Transport::new().context("failed to build transport")?;
    let hub = EventHub::new();

    let engine = Engine::new(
        store.clone(),
        transport,
        limiter,
        hub.clone(),
        zdmr::DEFAULT_CONCURRENCY,
    );
    engine.start();

    let token = store.api_token().await?;
    let port = u16::try_from(settings.local_api_port).unwrap_or(17777);
    zdmr::api::serve(engine, hub, token, port)
        .await
        .context("control api failed")?;

    Ok(())
}
