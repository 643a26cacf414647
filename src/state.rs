//! Connection state and the shared pipeline nucleus.
//!
//! The connection lifecycle flows through five states:
//!
//! ```text
//! Disconnected --connect--> Connecting --success--> Connected
//! Connected --disconnect--> Disconnecting --ack--> Disconnected
//! Connected --credential rotation--> Reauthorizing --reconnect--> Connected
//! any --transport failure--> Disconnected
//! ```
//!
//! [`Nucleus`] is the state every stage can see: the validated configuration,
//! the credential, and the current [`ConnectionState`]. The state lives in a
//! `watch` channel, whose internal lock is the one synchronization point for
//! both reads and transitions, so `connected()` can never observe a torn
//! value. Applications can subscribe to the same channel.
//!
//! # Examples
//!
//! ```ignore
//! let mut state_rx = pipeline.subscribe_state();
//! while state_rx.changed().await.is_ok() {
//!     println!("connection is now {}", *state_rx.borrow());
//! }
//! ```

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    config::{Credential, PipelineConfig},
    error::PipelineError,
};

/// Represents the current state of the pipeline's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection. The initial state.
    Disconnected,

    /// A connect request is with the transport.
    Connecting,

    /// Connected; operations needing a connection can proceed.
    Connected,

    /// A disconnect request is with the transport.
    Disconnecting,

    /// Tearing down and re-establishing the connection with a new credential.
    Reauthorizing,
}

impl ConnectionState {
    /// Returns a short string identifier for the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Reauthorizing => "Reauthorizing",
        }
    }

    /// True only in `Connected`.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True while a connection is being established or re-established.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reauthorizing
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Any state may drop to `Disconnected`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Disconnecting)
                | (Connected, Reauthorizing)
                | (Reauthorizing, Connected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared state visible to every stage.
pub struct Nucleus {
    config: PipelineConfig,
    credential: Credential,
    state_tx: watch::Sender<ConnectionState>,
    ever_connected: AtomicBool,
}

impl Nucleus {
    pub fn new(config: PipelineConfig, credential: Credential) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            credential,
            state_tx,
            ever_connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Derived from the state; there is no separate flag to set.
    pub fn connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    /// True once the pipeline has reached `Connected` at least once.
    pub fn ever_connected(&self) -> bool {
        self.ever_connected.load(Ordering::Acquire)
    }

    /// Subscribes to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Moves to `next` and returns the previous state.
    ///
    /// Re-entering the current state is a no-op and does not notify
    /// subscribers.
    ///
    /// # Errors
    ///
    /// `Pipeline` when the state machine does not allow the move; the state
    /// is left unchanged.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, PipelineError> {
        let mut previous = next;
        let mut allowed = true;
        self.state_tx.send_if_modified(|state| {
            previous = *state;
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                allowed = false;
                return false;
            }
            *state = next;
            true
        });

        if !allowed {
            warn!(from = %previous, to = %next, "Rejected connection state transition");
            return Err(PipelineError::Pipeline(format!(
                "invalid connection state transition from {previous} to {next}"
            )));
        }
        if previous != next {
            if next.is_connected() {
                self.ever_connected.store(true, Ordering::Release);
            }
            info!(from = %previous, to = %next, "Connection state changed");
        }
        Ok(previous)
    }
}
