// Waymark backend daemon: token verification, command delivery tracking, timeout sweep.

mod config;
mod service;
mod store;

use std::sync::Arc;

use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("waymark-server {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt::init();
    let cfg = config::load();

    let store = Arc::new(load_store(&cfg));
    let svc = Arc::new(service::PolService::new(
        store.clone(),
        cfg.deadline_ticks(),
        cfg.redundancy,
    ));
    info!(
        "waymark-server {} starting: sweep every {}s, ack deadline {}s, redundancy {}",
        VERSION, cfg.sweep_interval_secs, cfg.ack_deadline_secs, cfg.redundancy
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let sweep_svc = svc.clone();
        let interval = std::time::Duration::from_secs(cfg.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let timed_out = sweep_svc.sweep();
                if timed_out > 0 {
                    info!("{} delivery job(s) timed out", timed_out);
                }
            }
        });
        // The REST/relay front-end attaches through the PolService handle;
        // the daemon itself only owns the sweep loop and lifecycle.
        shutdown_signal().await
    })?;

    if let Some(path) = &cfg.state_path {
        match store.to_json() {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!("could not write state snapshot: {}", e);
                }
            }
            Err(e) => warn!("could not serialize state snapshot: {}", e),
        }
    }
    info!("waymark-server shut down");
    Ok(())
}

fn load_store(cfg: &config::Config) -> store::MemoryStore {
    if let Some(path) = &cfg.state_path {
        if let Ok(s) = std::fs::read_to_string(path) {
            match store::MemoryStore::from_json(&s) {
                Ok(m) => return m,
                Err(e) => warn!("ignoring corrupt state snapshot: {}", e),
            }
        }
    }
    store::MemoryStore::new()
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, the runtime and its tasks
/// exit; systemd may restart if configured.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
