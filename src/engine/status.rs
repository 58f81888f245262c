use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Initializing,
    Loading,
    Ready,
    Error,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Initializing => "initializing",
            EngineState::Loading => "loading",
            EngineState::Ready => "ready",
            EngineState::Error => "error",
        }
    }

    /// Forward steps only; `Error` is reachable from anywhere and terminal.
    pub fn can_transition_to(self, next: EngineState) -> bool {
        matches!(
            (self, next),
            (EngineState::Initializing, EngineState::Loading)
                | (EngineState::Loading, EngineState::Ready)
                | (EngineState::Initializing | EngineState::Loading | EngineState::Ready, EngineState::Error)
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub message: String,
    pub since: DateTime<Utc>,
}

impl EngineStatus {
    fn new(state: EngineState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            since: Utc::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == EngineState::Ready
    }
}

/// Owns the current [`EngineStatus`] and fans transitions out to
/// subscribers.
pub struct StatusManager {
    current: Mutex<EngineStatus>,
    subscribers: Mutex<Vec<Sender<EngineStatus>>>,
}

impl StatusManager {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(EngineStatus::new(EngineState::Initializing, "engine created")),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> EngineStatus {
        self.current.lock().clone()
    }

    pub fn state(&self) -> EngineState {
        self.current.lock().state
    }

    pub fn transition(&self, next: EngineState, message: impl Into<String>) -> Result<()> {
        let status = {
            let mut current = self.current.lock();
            if !current.state.can_transition_to(next) {
                return Err(EngineError::IllegalTransition {
                    from: current.state,
                    to: next,
                });
            }
            *current = EngineStatus::new(next, message);
            current.clone()
        };
        log::info!("Engine {}: {}", status.state, status.message);
        self.broadcast(status);
        Ok(())
    }

    /// Moves to `Error` unless already there. Returns whether it moved.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        match self.transition(EngineState::Error, message.clone()) {
            Ok(()) => true,
            Err(_) => {
                log::debug!("Ignoring failure after terminal error: {}", message);
                false
            }
        }
    }

    /// Receives the current status immediately, then every later transition.
    pub fn subscribe(&self) -> Receiver<EngineStatus> {
        let (tx, rx) = unbounded();
        let mut subscribers = self.subscribers.lock();
        let _ = tx.send(self.current());
        subscribers.push(tx);
        rx
    }

    fn broadcast(&self, status: EngineStatus) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(status.clone()).is_ok());
    }
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new()
    }
}
