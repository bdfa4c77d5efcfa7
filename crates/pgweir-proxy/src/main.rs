use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use pgweir_common::config::{
    self, resolve_path, AppConfig, BackendsConfig, RoutingConfig,
};
use tracing::info;

use pgweir_proxy::core::ProxyCore;
use pgweir_proxy::router::Router;
use pgweir_proxy::{dispatcher, listener, telemetry};

#[derive(Parser, Debug)]
#[command(name = "pgweir-proxy")]
#[command(about = "Connection-pooling proxy for PostgreSQL")]
struct Args {
    /// Path to the application config file
    #[arg(long, env = "PGWEIR_CONFIG", default_value = "pgweir.yaml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let app_cfg = config::load_app_config(&args.config)
        .with_context(|| format!("cannot load app config from {}", args.config.display()))?;

    let logging_path = resolve_path(&args.config, &app_cfg.logging.path);
    let logging_cfg = config::load_logging_config(&logging_path)
        .with_context(|| format!("cannot load logging config from {}", logging_path.display()))?;
    telemetry::init(&logging_cfg)?;

    let backends_path = resolve_path(&args.config, &app_cfg.backends.path);
    let backends_cfg = config::load_backends_config(&backends_path)
        .with_context(|| format!("cannot load backends config from {}", backends_path.display()))?;
    let routing_path = resolve_path(&args.config, &app_cfg.routing.path);
    let routing_cfg = config::load_routing_config(&routing_path)
        .with_context(|| format!("cannot load routing config from {}", routing_path.display()))?;

    info!(
        "app config {} -> listen {}:{}, {} backends, {} routing rules",
        args.config.display(),
        app_cfg.listen.host,
        app_cfg.listen.port,
        backends_cfg.backends.len(),
        routing_cfg.rules.len()
    );

    let runtime = tokio::runtime::Runtime::new()?;

    // A worker child is this same binary re-executed with the index in the
    // environment and the dispatcher socketpair on fd 3.
    if let Ok(index) = std::env::var(dispatcher::ENV_WORKER_INDEX) {
        let index: usize = index
            .parse()
            .with_context(|| format!("bad {}: {index:?}", dispatcher::ENV_WORKER_INDEX))?;
        return runtime.block_on(worker_main(index, &app_cfg, backends_cfg, &routing_cfg));
    }

    if !app_cfg.workers.is_empty() {
        return runtime.block_on(dispatcher_main(
            &args.config,
            &app_cfg,
            backends_cfg,
            &routing_cfg,
        ));
    }

    info!("starting in single-process mode");
    let core = ProxyCore::new(backends_cfg.backends, &routing_cfg)?;
    runtime.block_on(listener::run_listener(&app_cfg.listen, core))
}

async fn dispatcher_main(
    config_path: &Path,
    app_cfg: &AppConfig,
    backends_cfg: BackendsConfig,
    routing_cfg: &RoutingConfig,
) -> anyhow::Result<()> {
    let router = Arc::new(Router::new(backends_cfg.backends, routing_cfg)?);
    let plan = dispatcher::spawn_workers(config_path, app_cfg.workers.len())?;
    let map = dispatcher::backend_to_worker(&app_cfg.workers);
    dispatcher::run_dispatcher(&app_cfg.listen, router, plan.streams, map).await
}

async fn worker_main(
    index: usize,
    app_cfg: &AppConfig,
    backends_cfg: BackendsConfig,
    routing_cfg: &RoutingConfig,
) -> anyhow::Result<()> {
    let Some(entry) = app_cfg.workers.get(index) else {
        bail!("worker index {} out of range", index);
    };
    let owned: Vec<_> = backends_cfg
        .backends
        .into_iter()
        .filter(|b| entry.backends.contains(&b.name))
        .collect();
    if owned.is_empty() {
        bail!("worker {}: no matching backends", index);
    }
    info!("worker {} ready (backends: {})", index, owned.len());
    let core = ProxyCore::new(owned, routing_cfg)?;
    let sock = dispatcher::worker_socket()?;
    dispatcher::run_worker_loop(sock, core).await
}
