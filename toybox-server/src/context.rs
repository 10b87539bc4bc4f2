//! toybox-server/src/context.rs
//!
//! Everything a running bot process shares, built once at startup.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use toybox_core::chat::AuthorIndex;
use toybox_core::commands::registry::COMMANDS_KEY;
use toybox_core::commands::{CommandRegistry, Dispatcher};
use toybox_core::eventbus::EventBus;
use toybox_core::repositories::SqliteLedger;
use toybox_core::sync::{LocalChannel, RelayChannel};
use toybox_core::toys::{gamba, points, GambaToy, PointsToy, ShoutToy};
use toybox_core::traits::{PointsLedger, SyncChannel};
use toybox_core::{Database, Error};

pub const RELAY_PRIME_TIMEOUT: Duration = Duration::from_secs(10);

/// Keys that must reflect the hub before anything seeds defaults into them
/// or follows them.
pub const STARTUP_KEYS: [&str; 4] = [
    COMMANDS_KEY,
    points::SETTINGS_KEY,
    gamba::SETTINGS_KEY,
    gamba::CONTROL_KEY,
];

/// Where shared state lives for this process.
pub enum StateBackend {
    Local(Arc<LocalChannel>),
    Relay(Arc<RelayChannel>),
}

impl StateBackend {
    pub fn channel(&self) -> Arc<dyn SyncChannel> {
        match self {
            StateBackend::Local(c) => c.clone(),
            StateBackend::Relay(c) => c.clone(),
        }
    }
}

pub struct ServerContext {
    pub db: Database,
    pub event_bus: Arc<EventBus>,
    pub backend: StateBackend,
    pub authors: Arc<AuthorIndex>,
    pub registry: Arc<CommandRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub points: Arc<PointsToy>,
    pub gamba: Arc<GambaToy>,
}

impl ServerContext {
    pub async fn new(db_path: &Path, snapshot_path: &Path, relay_url: Option<&str>) -> Result<Self, Error> {
        // 1) Storage
        let db = Database::open(db_path).await?;
        db.migrate().await?;
        let ledger: Arc<dyn PointsLedger> = Arc::new(SqliteLedger::new(db.pool().clone()));

        // 2) Shared state
        let backend = match relay_url {
            Some(url) => {
                info!("Sharing state through relay {}", url);
                let relay = Arc::new(RelayChannel::connect(url));
                if !relay.prime(&STARTUP_KEYS, RELAY_PRIME_TIMEOUT).await {
                    relay.shutdown().await;
                    return Err(Error::Channel(format!(
                        "relay {url} sent no state within {RELAY_PRIME_TIMEOUT:?}; refusing to seed defaults over it"
                    )));
                }
                StateBackend::Relay(relay)
            }
            None => {
                info!("Sharing state through {}", snapshot_path.display());
                StateBackend::Local(Arc::new(LocalChannel::with_snapshot(snapshot_path)?))
            }
        };
        let channel = backend.channel();

        // 3) Pipeline
        let event_bus = Arc::new(EventBus::new());
        let authors = Arc::new(AuthorIndex::new());
        let registry = Arc::new(CommandRegistry::new(channel.clone()));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), ledger.clone(), event_bus.clone()));

        // 4) Toys
        let points = Arc::new(PointsToy::new(channel.clone(), ledger.clone(), authors.clone(), event_bus.clone()));
        let gamba = Arc::new(GambaToy::new(channel.clone(), ledger, event_bus.clone()));
        let shout = Arc::new(ShoutToy::new(channel));
        dispatcher.set_points_settings(points.settings());
        dispatcher.register_toy(points.descriptor());
        dispatcher.register_toy(gamba.descriptor());
        dispatcher.register_toy(shout.descriptor());
        info!("{} command(s) registered", registry.len());

        Ok(Self {
            db,
            event_bus,
            backend,
            authors,
            registry,
            dispatcher,
            points,
            gamba,
        })
    }
}
