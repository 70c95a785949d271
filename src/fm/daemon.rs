use crate::fm::cli::Args;
use crate::fm::config::{self, MasterConfig};
use crate::fm::supervisor::Supervisor;
use crate::fm::web_console;
use anyhow::Context as _;
use std::sync::Arc;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Effective config: file (or defaults) with command-line overrides applied.
pub fn resolve_config(args: &Args) -> anyhow::Result<MasterConfig> {
    let mut cfg = match args.config.as_deref() {
        Some(p) => config::load_master_config(p)?,
        None => MasterConfig::default(),
    };
    if let Some(port) = args.port {
        cfg.node.port = port;
    }
    config::validate(&cfg)?;
    Ok(cfg)
}

pub async fn run_daemon_async(args: Args) -> anyhow::Result<()> {
    init_logging();
    let cfg = resolve_config(&args)?;
    tracing::info!(
        component = "boot",
        "node_command={:?} node_port={} grace_ms={} log_capacity={}",
        cfg.node.command,
        cfg.node.port,
        cfg.node.stop_grace_period_ms,
        cfg.node.log_capacity
    );

    let supervisor = Arc::new(Supervisor::new(cfg.node.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut web = if cfg.web_console.enabled {
        let sup = Arc::clone(&supervisor);
        let wc = cfg.web_console.clone();
        Some(tokio::spawn(web_console::serve(wc, sup, shutdown_rx)))
    } else {
        None
    };

    if let Some(url) = args.fork_url.as_deref() {
        let out = supervisor.start(url, args.chain_id).await;
        if out.ok {
            tracing::info!(component = "boot", "boot_start outcome=ok {}", out.message);
        } else {
            tracing::warn!(component = "boot", "boot_start outcome=failed {}", out.message);
        }
    }

    // The web console only returns on its own when it failed; that ends the daemon too.
    let mut web_finished = false;
    let exit = tokio::select! {
        r = wait_for_shutdown_signal() => {
            if r.is_ok() {
                tracing::info!(component = "shutdown", "signal received; stopping node");
            }
            r
        }
        r = web_exit(&mut web) => {
            web_finished = true;
            let e = r.err().unwrap_or_else(|| anyhow::anyhow!("web_console exited before shutdown"));
            tracing::error!(component = "web", "web_console stopped: {e:#}");
            Err(e)
        }
    };

    let _ = shutdown_tx.send(true);
    if let Some(h) = web
        && !web_finished
    {
        match h.await {
            Ok(Err(e)) => tracing::warn!(component = "web", "web_console shutdown error: {e:#}"),
            Err(e) => tracing::warn!(component = "web", "web_console task failed: {e}"),
            Ok(Ok(())) => {}
        }
    }
    let stopped = supervisor.stop().await;
    tracing::info!(component = "shutdown", "done node_was_tracked={stopped}");
    exit
}

/// Resolves when the web console task ends; pends forever when the console is disabled.
async fn web_exit(web: &mut Option<JoinHandle<anyhow::Result<()>>>) -> anyhow::Result<()> {
    match web {
        Some(h) => h
            .await
            .unwrap_or_else(|e| Err(anyhow::anyhow!("web_console task failed: {e}"))),
        None => std::future::pending().await,
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut term = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut int = unix_signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
    Ok(())
}
