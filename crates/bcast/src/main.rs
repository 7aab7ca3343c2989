use std::sync::Arc;

use bcast_core::{
    accounts::{reload_registry, AccountWatcher},
    config::Config,
    registry::Registry,
    sender::Transport,
};
use bcast_http::HttpTransport;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bcast_core::logging::init("bcast")?;

    let cfg = Arc::new(Config::load()?);
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(cfg.api_base_url.clone(), cfg.request_timeout)?);

    let registry = Arc::new(Registry::default());
    match reload_registry(&registry, &cfg.accounts_file, transport.clone(), cfg.retry) {
        Ok(n) => tracing::info!(identities = n, path = %cfg.accounts_file.display(), "accounts loaded"),
        // Start anyway; the watcher picks the file up once it appears.
        Err(e) => tracing::warn!(error = %e, path = %cfg.accounts_file.display(), "no accounts loaded"),
    }

    let shutdown = CancellationToken::new();
    let watcher = AccountWatcher::new(
        cfg.accounts_file.clone(),
        cfg.reload_poll,
        registry.clone(),
        transport.clone(),
        cfg.retry,
    )
    .spawn(shutdown.clone());

    let out = bcast_telegram::router::run_polling(cfg, registry, transport).await;

    shutdown.cancel();
    let _ = watcher.await;
    out
}
