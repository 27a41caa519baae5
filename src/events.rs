//! Event bridge
//!
//! The only path by which session state reaches calling code. Every session
//! owns one [`EventBridge`]; the host subscribes to its broadcast channel.
//! Consecutive `stateChanged` notifications carrying the same state are
//! coalesced, except that an error notification always gets its follow-up
//! state delivered.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Externally visible stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Connecting,
    Reconnecting,
    Streaming,
    Buffering,
    Playing,
    Paused,
    Stopped,
    Failed,
    Disconnected,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Connecting => "connecting",
            StreamState::Reconnecting => "reconnecting",
            StreamState::Streaming => "streaming",
            StreamState::Buffering => "buffering",
            StreamState::Playing => "playing",
            StreamState::Paused => "paused",
            StreamState::Stopped => "stopped",
            StreamState::Failed => "failed",
            StreamState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications delivered to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    StateChanged { state: StreamState },
    ConnectionSuccess,
    ConnectionFailed { msg: String },
    Disconnect,
    BitrateUpdate { bps: u64 },
    PlayerError { msg: String },
    ReconnectAttempt { attempt: u32, max_retries: u32 },
    ReconnectExhausted { attempts: u32 },
    DestinationConnected { uri: String },
    DestinationFailed { uri: String, msg: String },
    RecordingStarted { path: PathBuf },
    RecordingStopped { path: PathBuf },
}

impl SessionEvent {
    /// Error notifications must be followed by a state notification
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            SessionEvent::ConnectionFailed { .. } | SessionEvent::PlayerError { .. }
        )
    }

    pub fn state(&self) -> Option<StreamState> {
        match self {
            SessionEvent::StateChanged { state } => Some(*state),
            _ => None,
        }
    }

    /// JSON form handed to the host view layer
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Sender for notifications that do not carry state (fan-out reports)
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SessionEvent>,
}

impl Notifier {
    pub fn notify(&self, event: SessionEvent) {
        debug_assert!(event.state().is_none(), "state changes go through the bridge");
        trace!("event: {:?}", event);
        let _ = self.tx.send(event);
    }
}

/// Per-session translator from transitions to notifications
pub struct EventBridge {
    tx: broadcast::Sender<SessionEvent>,
    last_state: Option<StreamState>,
    error_pending: bool,
}

impl EventBridge {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            last_state: None,
            error_pending: false,
        }
    }

    pub fn sender(&self) -> broadcast::Sender<SessionEvent> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            tx: self.tx.clone(),
        }
    }

    /// Last state delivered to the host
    pub fn last_state(&self) -> Option<StreamState> {
        self.last_state
    }

    /// Publish a state change. Returns false when coalesced away.
    pub fn state(&mut self, state: StreamState) -> bool {
        if self.last_state == Some(state) && !self.error_pending {
            trace!("Coalesced duplicate state {}", state);
            return false;
        }
        self.error_pending = false;
        self.last_state = Some(state);
        debug!("stateChanged -> {}", state);
        let _ = self.tx.send(SessionEvent::StateChanged { state });
        true
    }

    /// Publish any notification; state changes are routed through [`Self::state`]
    pub fn emit(&mut self, event: SessionEvent) {
        if let Some(state) = event.state() {
            self.state(state);
            return;
        }
        if event.is_error() {
            self.error_pending = true;
        }
        debug!("event: {:?}", event);
        let _ = self.tx.send(event);
    }
}
