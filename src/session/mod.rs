//! Session state machine shared by the publisher and player
//!
//! A session is the single primary publish-or-play attempt of one instance.
//! Each instance runs on one owner task; commands, engine callbacks and
//! timer fires are all delivered to that task's queues, so no two
//! transitions ever run concurrently.

pub mod player;
pub mod publisher;
pub mod registry;

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, field, info, info_span, Span};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::device::DeviceState;
use crate::error::SessionError;
use crate::events::{EventBridge, SessionEvent, StreamState};
use crate::fanout::DestinationStatus;
use crate::timer::{TimerKind, TimerSet};

pub use player::PlayerHandle;
pub use publisher::PublisherHandle;
pub use registry::SessionRegistry;

/// Reason shown when a dropped stream could not be re-established
pub(crate) const RECONNECT_FAILED: &str = "Stream lost: reconnect failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Player,
}

/// Internal machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Initializing,
    Ready,
    Connecting,
    Active,
    Reconnecting,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// States in which a connection exists or is being established
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Active | SessionState::Reconnecting
        )
    }
}

/// Why a session is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PauseReason {
    /// App went to the background
    Background,
    /// Player paused by the user
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Registry key of a publisher or player instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Span an owner task runs in; `session` is filled in per session
pub(crate) fn owner_span(role: Role, instance: InstanceId) -> Span {
    info_span!("session", ?role, %instance, session = field::Empty)
}

/// Tag the current owner span with the session now in progress
pub(crate) fn record_session(id: &SessionId) {
    Span::current().record("session", field::display(id));
}

/// Join a base URL and a stream key/name. The key is appended exactly once,
/// even if the base already ends with it.
pub fn resolve_target(base: &str, key: &str) -> Result<String, SessionError> {
    let base = base.trim();
    let key = key.trim().trim_matches('/');

    if base.is_empty() {
        return Err(SessionError::InvalidTarget("URL is empty".to_string()));
    }
    match base.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => {}
        _ => {
            return Err(SessionError::InvalidTarget(format!("Invalid URL: {}", base)));
        }
    }

    let base = base.trim_end_matches('/');
    if key.is_empty() || base.ends_with(&format!("/{}", key)) {
        return Ok(base.to_string());
    }
    Ok(format!("{}/{}", base, key))
}

/// The primary attempt of one instance
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub target: String,
    pub attempt: u32,
    /// Set while a background transition or bounce tears the connection down on purpose
    pub suppress_disconnect_events: bool,
    /// Cleared by `stop`; failures only retry while set
    pub stay_active: bool,
    /// Restart the stream on foreground
    pub resume: bool,
    /// Reached Active at least once
    pub ever_active: bool,
}

impl Session {
    pub fn new(target: String) -> Self {
        Self {
            id: SessionId::new(),
            target,
            attempt: 0,
            suppress_disconnect_events: false,
            stay_active: true,
            resume: false,
            ever_active: false,
        }
    }
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub instance: InstanceId,
    pub role: Role,
    pub state: SessionState,
    /// Last state delivered to the host
    pub stream_state: Option<StreamState>,
    pub session_id: Option<SessionId>,
    pub target: Option<String>,
    pub attempt: u32,
    pub pending_timers: usize,
    pub paused: Option<PauseReason>,
    pub device: Option<DeviceState>,
    pub destinations: Vec<DestinationStatus>,
    pub recording: Option<PathBuf>,
}

/// Outcome of a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    Retry { attempt: u32, delay: std::time::Duration },
    Exhausted { attempts: u32 },
}

/// State, timers and event bridge of one instance. Role specific actors
/// own one of these and drive it from their loop.
pub(crate) struct SessionCore {
    pub role: Role,
    pub instance: InstanceId,
    pub state: SessionState,
    pub session: Option<Session>,
    pub paused: Option<PauseReason>,
    pub timers: TimerSet,
    pub bridge: EventBridge,
}

impl SessionCore {
    pub fn new(role: Role, instance: InstanceId, timers: TimerSet, mut bridge: EventBridge) -> Self {
        // Nobody is subscribed yet; this only seeds de-duplication
        bridge.state(StreamState::Idle);
        Self {
            role,
            instance,
            state: SessionState::Idle,
            session: None,
            paused: None,
            timers,
            bridge,
        }
    }

    pub fn suppressed(&self) -> bool {
        self.session
            .as_ref()
            .map(|s| s.suppress_disconnect_events)
            .unwrap_or(false)
    }

    /// Make transitions visible again and drop any pending resume
    pub fn release_suppression(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.suppress_disconnect_events = false;
            session.resume = false;
        }
    }

    pub fn attempt(&self) -> u32 {
        self.session.as_ref().map(|s| s.attempt).unwrap_or(0)
    }

    pub fn target(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.target.clone())
    }

    fn external(&self, state: SessionState) -> Option<StreamState> {
        let retrying = self.attempt() > 0;
        match (self.role, state) {
            (_, SessionState::Stopped) => Some(StreamState::Stopped),
            (_, SessionState::Failed) => Some(StreamState::Failed),

            (Role::Publisher, SessionState::Connecting) if retrying => Some(StreamState::Reconnecting),
            (Role::Publisher, SessionState::Connecting) => Some(StreamState::Connecting),
            (Role::Publisher, SessionState::Active) => Some(StreamState::Streaming),
            (Role::Publisher, SessionState::Reconnecting) => Some(StreamState::Reconnecting),

            (Role::Player, SessionState::Connecting) if retrying => Some(StreamState::Buffering),
            (Role::Player, SessionState::Connecting) => Some(StreamState::Connecting),
            (Role::Player, SessionState::Active) => Some(StreamState::Playing),
            (Role::Player, SessionState::Reconnecting) => Some(StreamState::Buffering),
            (Role::Player, SessionState::Paused) => Some(StreamState::Paused),

            _ => None,
        }
    }

    /// Move to `to`, cancelling the timers owned by the state being left
    pub fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }

        match from {
            SessionState::Reconnecting => {
                self.timers.cancel(TimerKind::Reconnect);
                self.timers.cancel(TimerKind::BounceRestart);
            }
            SessionState::Paused => {
                self.timers.cancel(TimerKind::ResumeSettle);
                self.paused = None;
            }
            SessionState::Active => {
                self.timers
                    .cancel_matching(|kind| matches!(kind, TimerKind::KeyFrame(_)));
            }
            _ => {}
        }

        info!("{:?} {}: {:?} -> {:?}", self.role, self.instance, from, to);
        self.state = to;

        if self.suppressed() {
            debug!("State {:?} not reported (teardown in progress)", to);
            return;
        }
        if let Some(external) = self.external(to) {
            self.bridge.state(external);
        }
    }

    pub fn emit(&mut self, event: SessionEvent) {
        self.bridge.emit(event);
    }

    /// Count one more consecutive failure against `policy`
    pub fn next_retry(&self, policy: &BackoffPolicy) -> RetryDecision {
        let next = self.attempt() + 1;
        if next >= policy.max_retries {
            RetryDecision::Exhausted { attempts: next }
        } else {
            RetryDecision::Retry {
                attempt: next,
                delay: policy.delay(next - 1),
            }
        }
    }

    /// Stop from any state: timers are cancelled before anything else
    pub fn begin_stop(&mut self) -> bool {
        self.timers.cancel_all();
        let Some(session) = self.session.as_mut() else {
            if self.state != SessionState::Idle {
                self.state = SessionState::Idle;
            }
            return false;
        };
        session.stay_active = false;
        session.suppress_disconnect_events = false;
        session.resume = false;
        self.transition(SessionState::Stopping);
        true
    }

    /// Report `stopped` and forget the session
    pub fn finish_stop(&mut self) {
        self.transition(SessionState::Stopped);
        if let Some(session) = self.session.take() {
            info!("Session {} ended", session.id);
        }
        self.paused = None;
        self.state = SessionState::Idle;
    }

    /// Return a stopped or failed instance to Idle
    pub fn acknowledge(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Stopped | SessionState::Failed => {
                self.timers.cancel_all();
                self.session = None;
                self.paused = None;
                self.state = SessionState::Idle;
                self.bridge.state(StreamState::Idle);
            }
            other => debug!("Nothing to acknowledge in {:?}", other),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            instance: self.instance,
            role: self.role,
            state: self.state,
            stream_state: self.bridge.last_state(),
            session_id: self.session.as_ref().map(|s| s.id),
            target: self.target(),
            attempt: self.attempt(),
            pending_timers: self.timers.pending(),
            paused: self.paused,
            device: None,
            destinations: Vec::new(),
            recording: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn core(role: Role) -> SessionCore {
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionCore::new(role, InstanceId(1), TimerSet::new(tx), EventBridge::new(32))
    }

    #[test]
    fn test_resolve_target_appends_key_once() {
        assert_eq!(
            resolve_target("rtmp://host/live", "abc").unwrap(),
            "rtmp://host/live/abc"
        );
        assert_eq!(
            resolve_target("rtmp://host/live/", "abc").unwrap(),
            "rtmp://host/live/abc"
        );
        assert_eq!(
            resolve_target("rtmp://host/live/abc", "abc").unwrap(),
            "rtmp://host/live/abc"
        );
        assert_eq!(
            resolve_target(" rtsp://host:8554/cam ", "").unwrap(),
            "rtsp://host:8554/cam"
        );
    }

    #[test]
    fn test_resolve_target_rejects_bad_urls() {
        assert_eq!(
            resolve_target("  ", "abc"),
            Err(SessionError::InvalidTarget("URL is empty".to_string()))
        );
        assert!(matches!(
            resolve_target("host/live", "abc"),
            Err(SessionError::InvalidTarget(_))
        ));
        assert!(matches!(
            resolve_target("rtmp://", "abc"),
            Err(SessionError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_decisions_count_to_max() {
        let mut core = core(Role::Publisher);
        core.session = Some(Session::new("rtmp://h/live/k".to_string()));
        let policy = BackoffPolicy::default().with_max_retries(3);

        assert_eq!(
            core.next_retry(&policy),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        core.session.as_mut().unwrap().attempt = 1;
        assert_eq!(
            core.next_retry(&policy),
            RetryDecision::Retry {
                attempt: 2,
                delay: Duration::from_millis(2000)
            }
        );
        core.session.as_mut().unwrap().attempt = 2;
        assert_eq!(
            core.next_retry(&policy),
            RetryDecision::Exhausted { attempts: 3 }
        );
    }

    #[tokio::test]
    async fn test_transition_maps_states_per_role() {
        let mut publisher = core(Role::Publisher);
        let mut rx = publisher.bridge.subscribe();
        publisher.session = Some(Session::new("rtmp://h/live/k".to_string()));
        publisher.transition(SessionState::Initializing);
        publisher.transition(SessionState::Ready);
        publisher.transition(SessionState::Connecting);
        publisher.transition(SessionState::Active);
        assert_eq!(
            rx.try_recv().unwrap().state(),
            Some(StreamState::Connecting)
        );
        assert_eq!(rx.try_recv().unwrap().state(), Some(StreamState::Streaming));
        assert!(rx.try_recv().is_err());

        let mut player = core(Role::Player);
        let mut rx = player.bridge.subscribe();
        player.session = Some(Session::new("rtsp://h/cam".to_string()));
        player.session.as_mut().unwrap().attempt = 1;
        player.transition(SessionState::Connecting);
        assert_eq!(rx.try_recv().unwrap().state(), Some(StreamState::Buffering));
    }

    #[tokio::test]
    async fn test_suppressed_transitions_are_silent() {
        let mut core = core(Role::Publisher);
        let mut rx = core.bridge.subscribe();
        let mut session = Session::new("rtmp://h/live/k".to_string());
        session.suppress_disconnect_events = true;
        core.session = Some(session);

        core.transition(SessionState::Connecting);
        core.transition(SessionState::Paused);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_reconnecting_cancels_retry_timer() {
        let mut core = core(Role::Publisher);
        core.session = Some(Session::new("rtmp://h/live/k".to_string()));
        core.transition(SessionState::Reconnecting);
        core.timers.arm(TimerKind::Reconnect, Duration::from_secs(1));
        assert_eq!(core.timers.pending(), 1);

        core.transition(SessionState::Connecting);
        assert_eq!(core.timers.pending(), 0);
    }

    #[tokio::test]
    async fn test_stop_then_acknowledge() {
        let mut core = core(Role::Player);
        let mut rx = core.bridge.subscribe();
        core.session = Some(Session::new("rtsp://h/cam".to_string()));
        core.transition(SessionState::Failed);

        assert!(core.begin_stop());
        core.finish_stop();
        assert_eq!(core.state, SessionState::Idle);
        assert!(core.session.is_none());

        core.acknowledge();
        let states: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| e.state())
            .collect();
        assert_eq!(
            states,
            vec![StreamState::Failed, StreamState::Stopped, StreamState::Idle]
        );
        assert!(!core.begin_stop());
    }
}
