//! toybox-server/src/admin.rs
//!
//! One-shot subcommands: ledger maintenance, and host requests written to
//! the shared state of a running bot.

use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;

use toybox_core::repositories::SqliteLedger;
use toybox_core::sync::{LocalChannel, RelayChannel};
use toybox_core::toys::gamba::{self, send_request};
use toybox_core::toys::GambaAction;
use toybox_core::traits::{PointsLedger, SyncChannel};
use toybox_core::Database;

use crate::context::RELAY_PRIME_TIMEOUT;
use crate::{Args, GambaCommand};

async fn open_ledger(args: &Args) -> anyhow::Result<SqliteLedger> {
    let path = args.db_path();
    let db = Database::open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    db.migrate().await?;
    Ok(SqliteLedger::new(db.pool().clone()))
}

pub async fn set_banned(args: &Args, id: &str, banned: bool) -> anyhow::Result<()> {
    let ledger = open_ledger(args).await?;
    if banned {
        ledger.ban(id).await?;
        info!("Banned '{}'", id);
    } else {
        ledger.unban(id).await?;
        info!("Unbanned '{}'", id);
    }
    Ok(())
}

pub async fn show_user(args: &Args, id: &str) -> anyhow::Result<()> {
    let ledger = open_ledger(args).await?;
    match ledger.get_user(id).await? {
        Some(user) => {
            println!("{}", serde_json::to_string_pretty(&user)?);
            let last_stream = ledger.last_stream(id).await?;
            if let Some(stream) = last_stream {
                println!("last stream: {stream}");
            }
        }
        None => println!("No user '{id}'"),
    }
    Ok(())
}

pub async fn send_gamba(args: &Args, relay_url: Option<&str>, command: GambaCommand) -> anyhow::Result<()> {
    let action = match command {
        GambaCommand::Open { title, options } => GambaAction::Open { title, options },
        GambaCommand::Close => GambaAction::Close,
        GambaCommand::Resolve { winner } => GambaAction::Resolve { winner },
        GambaCommand::Cancel => GambaAction::Cancel,
    };

    let request = match relay_url {
        Some(url) => {
            let relay = Arc::new(RelayChannel::connect(url));
            if !relay.prime(&[gamba::CONTROL_KEY], RELAY_PRIME_TIMEOUT).await {
                relay.shutdown().await;
                bail!("relay {url} did not answer");
            }
            let request = send_request(relay.clone() as Arc<dyn SyncChannel>, action);
            relay.shutdown().await;
            request
        }
        None => {
            let path = args.snapshot_path();
            let local = LocalChannel::with_snapshot(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            send_request(Arc::new(local), action)
        }
    };
    info!("Sent gamba request {} ({:?})", request.id, request.action);
    Ok(())
}
