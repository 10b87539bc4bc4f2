use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

mod admin;
mod context;
mod server;

pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:9777";

#[derive(Parser, Debug, Clone)]
#[command(name = "toybox")]
#[command(author, version, about = "Toybox - live chat commands, points and overlay toys")]
pub struct Args {
    /// SQLite database file. Defaults to <data dir>/toybox/toybox.db
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// JSON snapshot backing local sync state. Defaults to <data dir>/toybox/state.json
    #[arg(long, global = true)]
    snapshot_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Follow one live chat and dispatch its commands.
    Run {
        /// Video id, watch URL, or channel handle such as @somebody
        target: String,

        /// Share state through a relay hub instead of the local snapshot file.
        #[arg(long)]
        relay_url: Option<String>,
    },
    /// Host the sync relay hub.
    Relay {
        #[arg(long, default_value = DEFAULT_RELAY_ADDR)]
        addr: String,
    },
    /// Ban a user from running commands.
    Ban { id: String },
    /// Lift a ban.
    Unban { id: String },
    /// Print a stored user.
    User { id: String },
    /// Host a betting round on the running bot.
    Gamba {
        /// Reach the bot through a relay hub instead of the local snapshot file.
        #[arg(long)]
        relay_url: Option<String>,

        #[command(subcommand)]
        action: GambaCommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum GambaCommand {
    /// Open a round. Chat bets with `!bet <amount> <option>`.
    Open {
        title: String,
        #[arg(required = true, num_args = 2..)]
        options: Vec<String>,
    },
    /// Stop taking bets.
    Close,
    /// Pay out. WINNER is an option name or its number.
    Resolve { winner: String },
    /// End the round and refund every bet.
    Cancel,
}

impl Args {
    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| data_dir().join("toybox.db"))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot_path.clone().unwrap_or_else(|| data_dir().join("state.json"))
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("toybox")
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env()
        .add_directive("toybox=info".parse().unwrap_or_default());
    let sub = fmt().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(sub) {
        eprintln!("Failed to set global subscriber: {e}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let args = Args::parse();
    info!("Toybox starting. command={:?}", args.command);

    let result = match args.command.clone() {
        Command::Run { target, relay_url } => server::run_server(&args, &target, relay_url.as_deref()).await,
        Command::Relay { addr } => server::run_relay(&addr).await,
        Command::Ban { id } => admin::set_banned(&args, &id, true).await,
        Command::Unban { id } => admin::set_banned(&args, &id, false).await,
        Command::User { id } => admin::show_user(&args, &id).await,
        Command::Gamba { relay_url, action } => admin::send_gamba(&args, relay_url.as_deref(), action).await,
    };
    if let Err(e) = &result {
        error!("Toybox error: {:?}", e);
    }
    info!("Main finished. Goodbye!");
    result
}
