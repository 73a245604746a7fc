use std::fmt;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Up,
    Down,
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteState::Up => write!(f, "up"),
            RemoteState::Down => write!(f, "down"),
        }
    }
}

/// Process-wide view of the remote store's reachability.
pub struct RemoteHealth {
    state: RwLock<RemoteState>,
}

impl RemoteHealth {
    pub fn new(initial: RemoteState) -> Self {
        RemoteHealth {
            state: RwLock::new(initial),
        }
    }

    pub fn state(&self) -> RemoteState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_up(&self) -> bool {
        self.state() == RemoteState::Up
    }

    /// Returns whether this call performed the `up -> down` transition.
    pub fn mark_down(&self, reason: &str) -> bool {
        if !self.is_up() {
            return false;
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state == RemoteState::Down {
            return false;
        }
        *state = RemoteState::Down;
        tracing::warn!(reason, "remote store marked down");
        true
    }

    /// Returns whether this call performed the `down -> up` transition.
    pub fn mark_up(&self) -> bool {
        if self.is_up() {
            return false;
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state == RemoteState::Up {
            return false;
        }
        *state = RemoteState::Up;
        tracing::info!("remote store marked up");
        true
    }
}

impl Default for RemoteHealth {
    fn default() -> Self {
        RemoteHealth::new(RemoteState::Up)
    }
}
