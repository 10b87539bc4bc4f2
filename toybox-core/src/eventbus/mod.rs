//! src/eventbus/mod.rs
//!
//! Provides an in-process event bus that supports guaranteed delivery
//! to multiple subscribers via bounded MPSC queues.

use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

use toybox_common::models::{ChatMessage, DispatchEvent};

/// Everything the pipeline announces to the rest of the process.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A deduplicated chat line, for passive listeners (chat bubbles, swarm
    /// detection, chat rewards).
    ChatMessage(ChatMessage),

    /// A command was accepted or rejected.
    Dispatch(DispatchEvent),

    /// Free-form status line for the log surface.
    SystemMessage(String),
}

impl BusEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            BusEvent::ChatMessage(_) => "chat_message",
            BusEvent::Dispatch(DispatchEvent::Accepted { .. }) => "command.accepted",
            BusEvent::Dispatch(DispatchEvent::Rejected { .. }) => "command.rejected",
            BusEvent::SystemMessage(_) => "system_message",
        }
    }
}

/// Each subscriber gets its own `mpsc::Sender<BusEvent>` for guaranteed delivery.
///
/// - If the subscriber’s channel buffer fills, `publish` will await
///   until there's space (backpressure).
/// - If the subscriber has dropped the `Receiver`, its sender is pruned on
///   the next publish.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<BusEvent>>>>,
    shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Default size for each subscriber’s buffer.
const DEFAULT_BUFFER_SIZE: usize = 10000;

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            subscribers: Arc::new(Mutex::new(vec![])),
            shutdown_tx: tx,
            shutdown_rx: rx,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Returns a receiver on which events will be delivered.
    pub async fn subscribe(&self, buffer_size: Option<usize>) -> mpsc::Receiver<BusEvent> {
        let size = buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let (tx, rx) = mpsc::channel(size);
        let mut subs = self.subscribers.lock().await;
        subs.push(tx);
        rx
    }

    /// Publish an event to all subscribers.
    pub async fn publish(&self, event: BusEvent) {
        let senders = {
            let mut subs = self.subscribers.lock().await;
            subs.retain(|s| !s.is_closed());
            subs.clone()
        };
        for s in senders {
            let _ = s.send(event.clone()).await;
        }
    }

    pub async fn publish_dispatch(&self, event: DispatchEvent) {
        self.publish(BusEvent::Dispatch(event)).await;
    }
}
