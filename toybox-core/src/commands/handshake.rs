// File: src/commands/handshake.rs

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Pending,
    Accepted,
    Rejected(String),
}

impl HandshakeState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, HandshakeState::Pending)
    }
}

/// Accept/reject token handed to every handler of one invocation.
///
/// Clones share state. The first `accept` or `reject` decides the outcome;
/// every later call returns `false` and changes nothing.
#[derive(Debug, Clone)]
pub struct Handshake {
    state: Arc<Mutex<HandshakeState>>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(HandshakeState::Pending)) }
    }

    pub fn accept(&self) -> bool {
        self.resolve(HandshakeState::Accepted)
    }

    pub fn reject(&self, reason: impl Into<String>) -> bool {
        self.resolve(HandshakeState::Rejected(reason.into()))
    }

    pub fn state(&self) -> HandshakeState {
        self.state.lock().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.state.lock().is_resolved()
    }

    fn resolve(&self, next: HandshakeState) -> bool {
        let mut state = self.state.lock();
        if state.is_resolved() {
            return false;
        }
        *state = next;
        true
    }
}
