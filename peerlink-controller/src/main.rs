// PeerLink controller: emulated radio, peering and logging tasks, local control socket.

mod config;
mod control;
mod logwriter;
mod radio;
mod store;
mod tasks;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use peerlink_core::{BlobStore, MacAddr, PeeringCore, RetryPolicy, SharedRegistry};

use crate::logwriter::FileLogWriter;
use crate::radio::{RadioInbox, UdpRadio};
use crate::store::FileStore;
use crate::tasks::{
    LoggingTask, PeeringTask, TelemetryQueue, COMMAND_QUEUE_LEN, EVENT_QUEUE_LEN,
    TELEMETRY_QUEUE_LEN,
};

const MAC_NAMESPACE: &str = "radio";
const MAC_KEY: &str = "mac";

#[derive(Parser)]
#[command(name = "peerlink-controller", version, about)]
struct Cli {
    /// Config file (default: ~/.config/peerlink/config.toml, then /etc/peerlink/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load(cli.config.as_deref())?;
    let store = Arc::new(
        FileStore::open(&cfg.data_dir)
            .with_context(|| format!("opening data dir {}", cfg.data_dir.display()))?,
    );
    let own = own_mac(cfg.mac, store.as_ref())?;
    info!("controller {} ({})", cfg.controller_name, own);

    let (telemetry_tx, telemetry_rx) = mpsc::channel(TELEMETRY_QUEUE_LEN);
    let registry = SharedRegistry::new();
    registry.load(
        Box::new(store.clone()),
        Some(Box::new(TelemetryQueue::new(telemetry_tx))),
        RetryPolicy::default(),
    )?;
    let logs = Arc::new(FileLogWriter::open(
        &cfg.log_dir,
        store.clone(),
        RetryPolicy::default(),
    ));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_LEN);
        let radio = Arc::new(
            UdpRadio::bind(cfg.radio_port, own, &cfg.link_key, RadioInbox::new(event_tx))
                .with_context(|| format!("binding radio port {}", cfg.radio_port))?,
        );
        let listener = TcpListener::bind(("127.0.0.1", cfg.control_port))
            .await
            .with_context(|| format!("binding control port {}", cfg.control_port))?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_LEN);
        let (note_tx, _) = broadcast::channel(16);

        let core = PeeringCore::new(own, &cfg.controller_name).with_timeout(cfg.peering_timeout());
        let mut peering = PeeringTask::new(
            core,
            registry.clone(),
            radio.clone(),
            note_tx.clone(),
            command_rx,
            event_rx,
        )
        .with_fallback_logs(logs.clone());
        peering.restore_links()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(radio.run_receiver(shutdown_rx.clone())),
            tokio::spawn(peering.run(shutdown_rx.clone())),
            tokio::spawn(LoggingTask::new(telemetry_rx, registry.clone(), logs).run(shutdown_rx)),
        ];
        tokio::spawn(async move {
            if let Err(e) = control::run_control(listener, command_tx, note_tx).await {
                error!("control socket stopped: {}", e);
            }
        });

        shutdown_signal().await?;
        info!("shutting down");
        let _ = shutdown_tx.send(true);
        join_all(tasks).await;
        Ok::<(), anyhow::Error>(())
    })?;

    registry.shutdown();
    Ok(())
}

/// Configured address, else the one generated on an earlier start, else a new random one.
fn own_mac(configured: Option<MacAddr>, store: &dyn BlobStore) -> anyhow::Result<MacAddr> {
    if let Some(mac) = configured {
        return Ok(mac);
    }
    if let Some(bytes) = store.read_blob(MAC_NAMESPACE, MAC_KEY)? {
        if let Ok(b) = <[u8; 6]>::try_from(bytes.as_slice()) {
            return Ok(MacAddr::new(b));
        }
        warn!("stored radio address unreadable, generating a new one");
    }
    let mut b = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut b);
    // Locally administered, unicast.
    b[0] = (b[0] & 0xfc) | 0x02;
    let mac = MacAddr::new(b);
    store.write_blob(MAC_NAMESPACE, MAC_KEY, mac.as_bytes())?;
    info!("generated radio address {}", mac);
    Ok(mac)
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for t in tasks {
        if let Err(e) = t.await {
            warn!("task ended abnormally: {}", e);
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
