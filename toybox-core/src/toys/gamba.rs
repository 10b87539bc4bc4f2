// File: src/toys/gamba.rs
//
// Pooled betting. The host opens a round with named options, chat bets on
// them, the host closes betting and picks the winner. Winners split the
// whole pool in proportion to their stake, rounded down per winner.
//
// The host drives a round by writing a `GambaRequest` to `CONTROL_KEY` from
// any process sharing the channel; the toy follows that key.

use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use toybox_common::models::{CommandDefinition, CommandParam, ParamType, UserUpdate};
use toybox_common::traits::{PointsLedger, SyncChannel};

use crate::commands::{CommandInvocation, Handshake};
use crate::eventbus::{BusEvent, EventBus};
use crate::sync::SyncedValue;
use crate::toys::ToyDescriptor;
use crate::Error;

pub const SETTINGS_KEY: &str = "settings:gamba";
pub const ROUND_KEY: &str = "toy:gamba";
pub const CONTROL_KEY: &str = "toy:gamba:control";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GambaSettings {
    pub min_bet: i64,
    /// 0 means no upper limit.
    pub max_bet: i64,
}

impl Default for GambaSettings {
    fn default() -> Self {
        Self { min_bet: 1, max_bet: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bet {
    pub user_id: String,
    pub user_name: String,
    /// Index into `Round::options`.
    pub option: usize,
    pub amount: i64,
}

/// The round as shown on the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub title: String,
    pub options: Vec<String>,
    pub bets: Vec<Bet>,
    pub status: RoundStatus,
}

impl Round {
    pub fn pool(&self) -> i64 {
        self.bets.iter().map(|b| b.amount).sum()
    }

    pub fn stake_on(&self, option: usize) -> i64 {
        self.bets.iter().filter(|b| b.option == option).map(|b| b.amount).sum()
    }

    /// Option by name (case-insensitive) or by 1-based number.
    pub fn find_option(&self, raw: &str) -> Option<usize> {
        let raw = raw.trim();
        if let Some(i) = self.options.iter().position(|o| o.eq_ignore_ascii_case(raw)) {
            return Some(i);
        }
        raw.parse::<usize>()
            .ok()
            .filter(|n| *n >= 1 && *n <= self.options.len())
            .map(|n| n - 1)
    }
}

/// What the host wants done with the round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GambaAction {
    Open { title: String, options: Vec<String> },
    Close,
    /// `winner` is an option name or 1-based number.
    Resolve { winner: String },
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GambaRequest {
    /// Fresh per request; a request is carried out at most once.
    pub id: String,
    #[serde(flatten)]
    pub action: GambaAction,
}

impl GambaRequest {
    pub fn new(action: GambaAction) -> Self {
        Self { id: Uuid::new_v4().to_string(), action }
    }
}

/// Writes `action` to the control key of `channel`. The toy following the
/// same key, in this process or another, carries it out.
pub fn send_request(channel: Arc<dyn SyncChannel>, action: GambaAction) -> GambaRequest {
    let request = GambaRequest::new(action);
    let control = SyncedValue::new(channel, CONTROL_KEY, None::<GambaRequest>);
    control.set(Some(request.clone()));
    control.dispose();
    request
}

/// Result of resolving a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payout {
    pub winning_option: String,
    pub pool: i64,
    pub winning_stake: i64,
    /// `(user_id, points)` per winner, in betting order.
    pub payouts: Vec<(String, i64)>,
    /// Points left over after rounding down each share. Nobody receives
    /// these; they are reported so the host can see them.
    pub remainder: i64,
    /// True when nobody backed the winner and every stake went back.
    pub refunded: bool,
}

/// Splits the pool. Each winner gets `floor(stake * pool / winning_stake)`.
pub fn compute_payout(round: &Round, winner: usize) -> Payout {
    let pool = round.pool();
    let winning_stake = round.stake_on(winner);
    let winning_option = round.options.get(winner).cloned().unwrap_or_default();

    if winning_stake == 0 {
        return Payout {
            winning_option,
            pool,
            winning_stake,
            payouts: round.bets.iter().map(|b| (b.user_id.clone(), b.amount)).collect(),
            remainder: 0,
            refunded: true,
        };
    }

    let payouts: Vec<(String, i64)> = round
        .bets
        .iter()
        .filter(|b| b.option == winner)
        .map(|b| {
            let share = i128::from(b.amount) * i128::from(pool) / i128::from(winning_stake);
            (b.user_id.clone(), share as i64)
        })
        .collect();
    let paid: i64 = payouts.iter().map(|(_, p)| p).sum();

    Payout {
        winning_option,
        pool,
        winning_stake,
        payouts,
        remainder: pool - paid,
        refunded: false,
    }
}

pub struct GambaToy {
    ledger: Arc<dyn PointsLedger>,
    settings: SyncedValue<GambaSettings>,
    round: Mutex<Option<Round>>,
    /// Copy of `round` for overlays.
    mirror: SyncedValue<Option<Round>>,
    event_bus: Arc<EventBus>,
    /// Kept alive so its listener keeps feeding `requests`.
    _control: SyncedValue<Option<GambaRequest>>,
    requests: Mutex<Option<mpsc::UnboundedReceiver<GambaRequest>>>,
    last_request: Mutex<Option<String>>,
}

impl GambaToy {
    pub const SLUG: &'static str = "gamba";

    pub fn new(channel: Arc<dyn SyncChannel>, ledger: Arc<dyn PointsLedger>, event_bus: Arc<EventBus>) -> Self {
        let control = SyncedValue::new(channel.clone(), CONTROL_KEY, None::<GambaRequest>);
        // Whatever was on the key before we started has already been handled.
        let last_request = control.read(|r| r.as_ref().map(|r| r.id.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        control.on_change(move |request: &Option<GambaRequest>| {
            if let Some(request) = request {
                let _ = tx.send(request.clone());
            }
        });

        Self {
            ledger,
            settings: SyncedValue::new(channel.clone(), SETTINGS_KEY, GambaSettings::default()),
            round: Mutex::new(None),
            mirror: SyncedValue::new(channel, ROUND_KEY, None),
            event_bus,
            _control: control,
            requests: Mutex::new(Some(rx)),
            last_request: Mutex::new(last_request),
        }
    }

    pub fn settings(&self) -> SyncedValue<GambaSettings> {
        self.settings.clone()
    }

    pub fn default_commands() -> Vec<CommandDefinition> {
        vec![CommandDefinition::new(Self::SLUG, "bet")
            .with_param(CommandParam::required("amount", ParamType::Number))
            .with_param(CommandParam::required("option", ParamType::String))]
    }

    pub fn descriptor(self: &Arc<Self>) -> ToyDescriptor {
        let toy = self.clone();
        ToyDescriptor {
            slug: Self::SLUG.to_string(),
            name: "Gamba".to_string(),
            commands: Self::default_commands(),
            handler: Arc::new(move |inv: CommandInvocation, hs: Handshake| {
                let toy = toy.clone();
                async move { toy.handle(inv, hs).await }.boxed()
            }),
        }
    }

    pub fn current_round(&self) -> Option<Round> {
        self.round.lock().clone()
    }

    pub fn open_round(&self, title: &str, options: Vec<String>) -> Result<(), Error> {
        if options.len() < 2 {
            return Err(Error::Parse("a round needs at least two options".into()));
        }
        {
            let mut round = self.round.lock();
            if round.is_some() {
                return Err(Error::Conflict("a round is already running".into()));
            }
            *round = Some(Round {
                title: title.to_string(),
                options,
                bets: Vec::new(),
                status: RoundStatus::Open,
            });
        }
        info!("Gamba: opened round '{}'", title);
        self.sync_mirror();
        Ok(())
    }

    /// Stops accepting bets.
    pub fn close_round(&self) -> Result<(), Error> {
        {
            let mut round = self.round.lock();
            match round.as_mut() {
                Some(r) if r.status == RoundStatus::Open => r.status = RoundStatus::Closed,
                Some(_) => return Err(Error::Conflict("betting is already closed".into())),
                None => return Err(Error::NotFound("no round is running".into())),
            }
        }
        self.sync_mirror();
        Ok(())
    }

    /// Pays out and ends the round. `winner` is an option name or number.
    pub async fn resolve(&self, winner: &str) -> Result<Payout, Error> {
        let round = {
            let mut guard = self.round.lock();
            let Some(round) = guard.as_ref() else {
                return Err(Error::NotFound("no round is running".into()));
            };
            if round.find_option(winner).is_none() {
                return Err(Error::NotFound(format!("no option '{winner}'")));
            }
            guard.take()
        };
        let Some(round) = round else {
            return Err(Error::NotFound("no round is running".into()));
        };
        let winner_idx = round.find_option(winner).unwrap_or_default();
        let payout = compute_payout(&round, winner_idx);
        self.sync_mirror();

        for (user_id, amount) in &payout.payouts {
            if *amount == 0 {
                continue;
            }
            if let Err(e) = self.ledger.update_user(user_id, &UserUpdate::points(*amount)).await {
                error!("Gamba: paying {} to {} failed => {:?}", amount, user_id, e);
            }
        }

        if payout.remainder > 0 {
            warn!(
                "Gamba: {} point(s) of the {} pool were left undistributed by rounding",
                payout.remainder, payout.pool
            );
        }
        let line = if payout.refunded {
            format!("Nobody backed {}; all {} points were refunded", payout.winning_option, payout.pool)
        } else {
            format!(
                "{} wins! {} winner(s) split {} points ({} left over)",
                payout.winning_option,
                payout.payouts.len(),
                payout.pool,
                payout.remainder
            )
        };
        self.event_bus.publish(BusEvent::SystemMessage(line)).await;
        Ok(payout)
    }

    /// Ends the round and gives every stake back.
    pub async fn cancel(&self) -> Result<usize, Error> {
        let round = self
            .round
            .lock()
            .take()
            .ok_or_else(|| Error::NotFound("no round is running".into()))?;
        self.sync_mirror();
        for bet in &round.bets {
            if let Err(e) = self.ledger.update_user(&bet.user_id, &UserUpdate::points(bet.amount)).await {
                error!("Gamba: refund to {} failed => {:?}", bet.user_id, e);
            }
        }
        Ok(round.bets.len())
    }

    /// Carries out host requests arriving on `CONTROL_KEY` until shutdown.
    /// Only the first call gets a working listener.
    pub fn spawn_control_listener(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let requests = self.requests.lock().take();
        tokio::spawn(async move {
            let Some(mut requests) = requests else {
                warn!("Gamba: control listener is already running");
                return;
            };
            loop {
                tokio::select! {
                    request = requests.recv() => match request {
                        Some(request) => self.apply_request(request).await,
                        None => break,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Gamba: control listener stopped");
        })
    }

    async fn apply_request(&self, request: GambaRequest) {
        {
            let mut last = self.last_request.lock();
            if last.as_deref() == Some(request.id.as_str()) {
                return;
            }
            *last = Some(request.id.clone());
        }

        let result = match &request.action {
            GambaAction::Open { title, options } => self.open_round(title, options.clone()),
            GambaAction::Close => self.close_round(),
            GambaAction::Resolve { winner } => self.resolve(winner).await.map(|_| ()),
            GambaAction::Cancel => self.cancel().await.map(|n| info!("Gamba: refunded {} bet(s)", n)),
        };
        if let Err(e) = result {
            warn!("Gamba: request {:?} failed => {}", request.action, e);
            self.event_bus
                .publish(BusEvent::SystemMessage(format!("Gamba: {e}")))
                .await;
        }
    }

    async fn handle(&self, inv: CommandInvocation, hs: Handshake) {
        match self.place_bet(&inv).await {
            Ok(()) => {
                hs.accept();
            }
            Err(reason) => {
                hs.reject(reason);
            }
        }
    }

    async fn place_bet(&self, inv: &CommandInvocation) -> Result<(), String> {
        let raw_amount = inv.params.get("amount").and_then(|v| v.as_number()).unwrap_or(f64::NAN);
        let option_raw = inv
            .params
            .get("option")
            .and_then(|v| v.as_text())
            .unwrap_or_default()
            .to_string();
        let user_id = inv.message.author_id.clone();

        if !raw_amount.is_finite() || raw_amount.fract() != 0.0 {
            return Err("bets must be whole numbers".to_string());
        }
        let amount = raw_amount as i64;
        let limits = self.settings.get();
        if amount < limits.min_bet.max(1) {
            return Err(format!("the minimum bet is {}", limits.min_bet.max(1)));
        }
        if limits.max_bet > 0 && amount > limits.max_bet {
            return Err(format!("the maximum bet is {}", limits.max_bet));
        }
        if inv.user.points < amount {
            return Err(format!("you only have {} points", inv.user.points));
        }

        let option = {
            let guard = self.round.lock();
            let Some(round) = guard.as_ref().filter(|r| r.status == RoundStatus::Open) else {
                return Err("no betting round is open".to_string());
            };
            let Some(option) = round.find_option(&option_raw) else {
                return Err(format!("pick one of: {}", round.options.join(", ")));
            };
            if let Some(prev) = round.bets.iter().find(|b| b.user_id == user_id) {
                if prev.option != option {
                    return Err(format!("you already bet on {}", round.options[prev.option]));
                }
            }
            option
        };

        let debit = UserUpdate::points(-amount).with_display_name(&inv.message.author_name);
        if let Err(e) = self.ledger.update_user(&user_id, &debit).await {
            error!("Gamba: debit for {} failed => {:?}", user_id, e);
            return Err("your bet could not be placed right now".to_string());
        }

        let placed = {
            let mut guard = self.round.lock();
            match guard.as_mut().filter(|r| r.status == RoundStatus::Open) {
                Some(round) => {
                    round.bets.push(Bet {
                        user_id: user_id.clone(),
                        user_name: inv.message.author_name.clone(),
                        option,
                        amount,
                    });
                    true
                }
                None => false,
            }
        };
        if !placed {
            // Betting closed while the debit was in flight.
            if let Err(e) = self.ledger.update_user(&user_id, &UserUpdate::points(amount)).await {
                error!("Gamba: refund to {} failed => {:?}", user_id, e);
            }
            return Err("betting closed before your bet landed".to_string());
        }
        self.sync_mirror();
        Ok(())
    }

    fn sync_mirror(&self) {
        let snapshot = self.round.lock().clone();
        self.mirror.set(snapshot);
    }
}
