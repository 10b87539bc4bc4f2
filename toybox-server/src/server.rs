//! toybox-server/src/server.rs
//!
//! Long-running modes: the chat bot itself, and the relay hub.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use toybox_core::chat::ChatIngest;
use toybox_core::sync::local::spawn_snapshot_watch;
use toybox_core::sync::RelayHub;
use toybox_core::tasks::{spawn_chat_poller, PollerConfig};

use crate::context::{ServerContext, StateBackend};
use crate::Args;

const SNAPSHOT_POLL: Duration = Duration::from_secs(1);

pub async fn run_server(args: &Args, target: &str, relay_url: Option<&str>) -> anyhow::Result<()> {
    let ctx = ServerContext::new(&args.db_path(), &args.snapshot_path(), relay_url).await?;
    for def in ctx.registry.snapshot().values() {
        info!("  !{} => {}{}", def.command, def.slug, if def.enabled { "" } else { " (disabled)" });
    }

    // 1) Other processes writing the snapshot file.
    let snapshot_task = match &ctx.backend {
        StateBackend::Local(local) => Some(spawn_snapshot_watch(
            local.clone(),
            SNAPSHOT_POLL,
            ctx.event_bus.shutdown_rx.clone(),
        )),
        StateBackend::Relay(_) => None,
    };

    // 2) Chat rewards listen on the bus.
    let rewards_rx = ctx.event_bus.subscribe(None).await;
    let rewards_task = ctx.points.clone().spawn_chat_rewards(rewards_rx);

    // 3) Host requests for the betting round.
    let gamba_task = ctx.gamba.clone().spawn_control_listener(ctx.event_bus.shutdown_rx.clone());

    // 4) The chat itself.
    let ingest = ChatIngest::new(ctx.authors.clone());
    let poller_task = spawn_chat_poller(
        PollerConfig::new(target),
        ingest,
        ctx.dispatcher.clone(),
        ctx.event_bus.shutdown_rx.clone(),
    )?;

    // Ctrl-C => signal
    let eb_for_ctrlc = ctx.event_bus.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {:?}", e);
        }
        info!("Ctrl-C detected; shutting down event bus...");
        eb_for_ctrlc.shutdown();
    });

    let mut shutdown_rx = ctx.event_bus.shutdown_rx.clone();
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
    info!("Shutdown signaled; stopping tasks.");

    if let Err(e) = poller_task.await {
        warn!("Chat poller task ended abnormally: {:?}", e);
    }
    if let Err(e) = rewards_task.await {
        warn!("Chat reward task ended abnormally: {:?}", e);
    }
    if let Err(e) = gamba_task.await {
        warn!("Gamba control task ended abnormally: {:?}", e);
    }
    if let Some(task) = snapshot_task {
        let _ = task.await;
    }

    // Stakes of an unresolved round go back to their owners.
    if ctx.gamba.current_round().is_some() {
        match ctx.gamba.cancel().await {
            Ok(n) => info!("Refunded {} open bet(s)", n),
            Err(e) => error!("Could not refund open bets: {:?}", e),
        }
    }

    if let StateBackend::Relay(relay) = &ctx.backend {
        relay.shutdown().await;
    }
    ctx.db.pool().close().await;
    info!("Server shutdown complete.");
    Ok(())
}

pub async fn run_relay(addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding relay to {addr}"))?;
    let hub = Arc::new(RelayHub::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {:?}", e);
        }
        info!("Ctrl-C detected; stopping relay...");
        let _ = shutdown_tx.send(true);
    });

    hub.serve(listener, shutdown_rx).await?;
    Ok(())
}
