use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::sync::watch;

use crate::spyglass::{
    blocklist::{MojangBlocklist, SharedBlocklist},
    config, logging,
    probe::dns::Dns,
    resolver::Service,
    routes,
    store::Store,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    // The EULA flag must be answerable from the first request on.
    let blocklist = Arc::new(MojangBlocklist::new());
    blocklist
        .refresh()
        .await
        .context("blocklist: initial fetch")?;

    let store = match &cfg.redis {
        Some(url) => {
            let store = Store::connect(url)
                .await
                .with_context(|| "store: connect")?;
            tracing::info!("store: connected");
            Some(store)
        }
        None => {
            tracing::warn!(
                "store: no redis url configured; caching and request coalescing are disabled"
            );
            None
        }
    };

    let dns = Arc::new(Dns::new()?);

    tracing::info!(
        config = %resolved.path.display(),
        environment = %cfg.environment,
        locks = cfg.cache.enable_locks,
        cached = store.is_some(),
        "spyglass: starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(blocklist.clone().run(shutdown_rx));

    let shared: SharedBlocklist = blocklist;
    let service = Arc::new(Service::new(cfg.clone(), store, shared, dns));
    let app = routes::router(service);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(addr = %addr, "spyglass: listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutdown: signal");
    let _ = shutdown_tx.send(true);

    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
