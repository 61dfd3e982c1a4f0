//! `serve` mode: wire the driver, mapper, optimizer and API together and
//! run until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use fuse_core::{FusionConfig, PlatformKind};
use fuse_pack::Fuser;
use fusegrid_dispatch::{EchoHandler, HandlerRegistry, HttpResolver, LocalRuntime};
use fusegrid_driver::{InMemoryPlatform, NuctlDriver, PlatformDriver};
use fusegrid_mapper::GroupMapper;
use fusegrid_optimizer::{Optimizer, build_strategy};
use tokio::sync::watch;
use tracing::{error, info, warn};

pub async fn run(config: FusionConfig) -> anyhow::Result<()> {
    info!(
        listen = %config.server.listen,
        platform = ?config.platform.kind,
        "FuseGrid daemon starting"
    );

    // ── Directories ────────────────────────────────────────────

    let work_dir = &config.build.work_dir;
    let tasks_dir = &config.build.tasks_dir;
    std::fs::create_dir_all(work_dir)?;
    std::fs::create_dir_all(tasks_dir)?;
    info!(work_dir = %work_dir.display(), tasks_dir = %tasks_dir.display(), "build directories ready");

    // ── Platform driver ────────────────────────────────────────

    let driver: Arc<dyn PlatformDriver> = match config.platform.kind {
        PlatformKind::Memory => {
            // Groups resolve moved tasks against this daemon's own API.
            let api = config
                .server
                .public_address
                .clone()
                .unwrap_or_else(|| local_api(&config.server.listen));
            let resolver = HttpResolver::new(api, Duration::from_secs(config.platform.invoke_timeout_secs));
            let handlers = HandlerRegistry::new().with_fallback(Arc::new(EchoHandler));
            let runtime = LocalRuntime::new(handlers, Arc::new(resolver));
            Arc::new(InMemoryPlatform::new().with_runtime(Arc::new(runtime)))
        }
        PlatformKind::Nuctl => {
            let driver = NuctlDriver::from_config(&config.platform, config.server.public_address.clone())
                .connect()
                .await?;
            Arc::new(driver)
        }
    };
    info!(driver = driver.name(), "platform driver ready");

    // ── Mapper + recovery ──────────────────────────────────────

    let fuser = Fuser::new(work_dir.clone(), config.build.merge_policy);
    let mapper = Arc::new(GroupMapper::new(fuser, driver).with_tasks_dir(tasks_dir.clone()));

    match mapper.recover(tasks_dir).await {
        Ok(report) => info!(
            adopted = report.adopted.len(),
            rebuilt = report.rebuilt.deployed.len(),
            residue_deleted = report.residue_deleted.len(),
            residue_failed = report.residue_failed.len(),
            dropped_tasks = report.dropped_tasks.len(),
            "recovered fusion setup"
        ),
        Err(e) => warn!(error = %e, "recovery incomplete, continuing with what was adopted"),
    }

    // ── Optimizer ──────────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let optimizer_handle = match build_strategy(&config.optimizer)? {
        Some(strategy) => {
            info!(strategy = strategy.name(), "optimizer enabled");
            let optimizer = Optimizer::new(mapper.clone(), strategy);
            Some(tokio::spawn(optimizer.run(shutdown_rx)))
        }
        None => {
            info!("no optimizer configured");
            None
        }
    };

    // ── API server ─────────────────────────────────────────────

    let router = fusegrid_api::build_router(mapper.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    info!(addr = %listener.local_addr()?, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Some(handle) = optimizer_handle {
        let _ = handle.await;
    }

    info!(groups = mapper.list().await.len(), "FuseGrid daemon stopped");
    Ok(())
}

/// Loopback address of the API when it listens on every interface.
fn local_api(listen: &str) -> String {
    match listen.rsplit_once(':') {
        Some(("0.0.0.0" | "[::]", port)) => format!("127.0.0.1:{port}"),
        _ => listen.to_string(),
    }
}
