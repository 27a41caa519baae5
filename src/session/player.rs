//! Player session actor

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn, Instrument};

use super::{
    owner_span, record_session, resolve_target, InstanceId, PauseReason, RetryDecision, Role,
    Session, SessionCore, SessionSnapshot, SessionState, RECONNECT_FAILED,
};
use crate::backoff::BackoffPolicy;
use crate::config::{Config, LifecycleConfig, PlayerConfig};
use crate::engine::{PlayerCallback, PlayerEngine};
use crate::error::{FailureClass, SessionError};
use crate::events::{EventBridge, SessionEvent, StreamState};
use crate::timer::{TimerFired, TimerInvalidator, TimerKind, TimerSet};

/// Commands accepted by a player instance
#[derive(Debug)]
pub enum PlayerCommand {
    /// Open `url` (or the configured URL)
    Play { url: Option<String> },
    Pause,
    Resume,
    Stop,
    SeekTo(u64),
    SetVolume(f32),
    SetMuted(bool),
    SetRate(f32),
    Background,
    Foreground,
    Acknowledge,
    Position { reply: oneshot::Sender<u64> },
    Duration { reply: oneshot::Sender<u64> },
    Snapshot { reply: oneshot::Sender<SessionSnapshot> },
    Shutdown,
}

/// Cloneable handle to a running player instance
#[derive(Clone)]
pub struct PlayerHandle {
    instance: InstanceId,
    cmd_tx: mpsc::UnboundedSender<PlayerCommand>,
    events: broadcast::Sender<SessionEvent>,
    invalidator: TimerInvalidator,
}

impl PlayerHandle {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> BroadcastStream<SessionEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    fn send(&self, cmd: PlayerCommand) {
        if let Err(e) = self.cmd_tx.send(cmd) {
            debug!("Player {} is gone; dropping {:?}", self.instance, e.0);
        }
    }

    pub fn play(&self, url: Option<&str>) {
        self.send(PlayerCommand::Play {
            url: url.map(str::to_string),
        });
    }

    pub fn pause(&self) {
        self.send(PlayerCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(PlayerCommand::Resume);
    }

    pub fn stop(&self) {
        self.invalidator.invalidate();
        self.send(PlayerCommand::Stop);
    }

    pub fn seek_to(&self, position_ms: u64) {
        self.send(PlayerCommand::SeekTo(position_ms));
    }

    pub fn set_volume(&self, volume: f32) {
        self.send(PlayerCommand::SetVolume(volume));
    }

    pub fn set_muted(&self, muted: bool) {
        self.send(PlayerCommand::SetMuted(muted));
    }

    pub fn set_rate(&self, rate: f32) {
        self.send(PlayerCommand::SetRate(rate));
    }

    pub fn background(&self) {
        self.send(PlayerCommand::Background);
    }

    pub fn foreground(&self) {
        self.send(PlayerCommand::Foreground);
    }

    pub fn acknowledge(&self) {
        self.send(PlayerCommand::Acknowledge);
    }

    pub async fn position(&self) -> Option<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(PlayerCommand::Position { reply: tx });
        rx.await.ok()
    }

    pub async fn duration(&self) -> Option<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(PlayerCommand::Duration { reply: tx });
        rx.await.ok()
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(PlayerCommand::Snapshot { reply: tx });
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        self.invalidator.invalidate();
        self.send(PlayerCommand::Shutdown);
    }

    pub async fn closed(&self) {
        self.cmd_tx.closed().await
    }
}

/// Spawn a player instance on the current runtime
pub fn spawn_player(instance: InstanceId, config: &Config, engine: Box<dyn PlayerEngine>) -> PlayerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let (callback_tx, callback_rx) = mpsc::unbounded_channel();

    let timers = TimerSet::new(timer_tx);
    let invalidator = timers.invalidator();
    let bridge = EventBridge::new(config.event_capacity);
    let events = bridge.sender();

    let mut engine = engine;
    engine.bind(callback_tx);

    let actor = PlayerActor {
        core: SessionCore::new(Role::Player, instance, timers, bridge),
        config: config.player.clone(),
        lifecycle: config.lifecycle.clone(),
        engine,
        last_play_at: None,
        volume: 1.0,
        muted: false,
        backgrounded: false,
        cmd_rx,
        timer_rx,
        callback_rx,
    };
    tokio::spawn(actor.run().instrument(owner_span(Role::Player, instance)));

    PlayerHandle {
        instance,
        cmd_tx,
        events,
        invalidator,
    }
}

struct PlayerActor {
    core: SessionCore,
    config: PlayerConfig,
    lifecycle: LifecycleConfig,
    engine: Box<dyn PlayerEngine>,
    last_play_at: Option<Instant>,
    volume: f32,
    muted: bool,
    backgrounded: bool,
    cmd_rx: mpsc::UnboundedReceiver<PlayerCommand>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    callback_rx: mpsc::UnboundedReceiver<PlayerCallback>,
}

impl PlayerActor {
    async fn run(mut self) {
        info!("Player {} started", self.core.instance);

        loop {
            tokio::select! {
                biased;

                Some(callback) = self.callback_rx.recv() => {
                    self.handle_callback(callback);
                }

                Some(fired) = self.timer_rx.recv() => {
                    self.handle_timer(fired);
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(PlayerCommand::Shutdown) | None => {
                            self.stop();
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
            }
        }

        info!("Player {} shut down", self.core.instance);
    }

    fn handle_command(&mut self, cmd: PlayerCommand) {
        match cmd {
            PlayerCommand::Play { url } => self.play(url),
            PlayerCommand::Pause => self.pause(),
            PlayerCommand::Resume => self.resume(),
            PlayerCommand::Stop => self.stop(),
            PlayerCommand::SeekTo(position_ms) => {
                if self.core.session.is_some() {
                    self.engine.seek(position_ms);
                }
            }
            PlayerCommand::SetVolume(volume) => {
                self.volume = volume.clamp(0.0, 1.0);
                self.apply_volume();
            }
            PlayerCommand::SetMuted(muted) => {
                self.muted = muted;
                self.apply_volume();
            }
            PlayerCommand::SetRate(rate) => {
                if rate.is_finite() && rate > 0.0 {
                    self.engine.set_rate(rate);
                } else {
                    debug!("Ignoring playback rate {}", rate);
                }
            }
            PlayerCommand::Background => self.background(),
            PlayerCommand::Foreground => self.foreground(),
            PlayerCommand::Acknowledge => {
                if self.core.state.is_live() || self.core.state == SessionState::Paused {
                    debug!("Acknowledge ignored while {:?}", self.core.state);
                } else {
                    self.core.acknowledge();
                }
            }
            PlayerCommand::Position { reply } => {
                let _ = reply.send(self.engine.position_ms());
            }
            PlayerCommand::Duration { reply } => {
                let _ = reply.send(self.engine.duration_ms());
            }
            PlayerCommand::Snapshot { reply } => {
                let _ = reply.send(self.core.snapshot());
            }
            PlayerCommand::Shutdown => {}
        }
    }

    fn handle_timer(&mut self, fired: TimerFired) {
        if !self.core.timers.accept(fired) {
            return;
        }

        match fired.kind {
            TimerKind::Reconnect => {
                if self.core.state == SessionState::Reconnecting {
                    self.open();
                }
            }
            TimerKind::ResumeSettle => {
                if self.core.state == SessionState::Paused {
                    info!("Resuming playback");
                    if let Some(session) = self.core.session.as_mut() {
                        session.attempt = 0;
                    }
                    self.open();
                    self.core.release_suppression();
                }
            }
            other => debug!("Player ignores {:?} timer", other),
        }
    }

    fn handle_callback(&mut self, callback: PlayerCallback) {
        let suppressed = self.core.suppressed();
        match callback {
            PlayerCallback::Connecting => debug!("Player engine connecting"),
            PlayerCallback::Buffering => {
                if self.core.state == SessionState::Active && !suppressed {
                    self.core.bridge.state(StreamState::Buffering);
                }
            }
            PlayerCallback::Playing => match self.core.state {
                SessionState::Connecting => self.on_playing(),
                SessionState::Active if !suppressed => {
                    self.core.bridge.state(StreamState::Playing);
                }
                state => debug!("Ignoring playing in {:?}", state),
            },
            PlayerCallback::Error { msg } => {
                let ever_active = self.core.session.as_ref().map(|s| s.ever_active).unwrap_or(false);
                let error = match SessionError::classify(&msg) {
                    SessionError::ConnectFailed(msg) if ever_active => SessionError::StreamLost(msg),
                    other => other,
                };
                self.on_failure(error);
            }
            PlayerCallback::Ended => {
                if self.core.state == SessionState::Active {
                    self.on_failure(SessionError::StreamLost("Stream ended".to_string()));
                }
            }
        }
    }

    fn play(&mut self, url: Option<String>) {
        let now = Instant::now();
        if let Some(last) = self.last_play_at {
            if now.duration_since(last) < self.config.play_debounce() {
                debug!("Ignoring play within debounce window");
                return;
            }
        }
        self.last_play_at = Some(now);

        if matches!(self.core.state, SessionState::Connecting | SessionState::Active) {
            debug!("Already playing");
            return;
        }

        if self.core.session.is_some() {
            self.stop();
        }
        self.core.acknowledge();

        let base = url.unwrap_or_else(|| self.config.url.clone());
        let target = match resolve_target(&base, &self.config.stream_name) {
            Ok(target) => target,
            Err(e) => return self.fail(e),
        };

        let session = Session::new(target);
        record_session(&session.id);
        info!("Playback session {} <- {}", session.id, session.target);
        self.core.session = Some(session);
        self.core.transition(SessionState::Initializing);
        self.core.transition(SessionState::Ready);

        if self.backgrounded {
            info!("Backgrounded; playback starts on foreground");
            if let Some(session) = self.core.session.as_mut() {
                session.resume = true;
            }
            self.core.transition(SessionState::Paused);
            self.core.paused = Some(PauseReason::Background);
            return;
        }
        self.open();
    }

    /// Enter Connecting and issue exactly one open
    fn open(&mut self) {
        let Some(target) = self.core.target() else {
            return;
        };
        self.core.transition(SessionState::Connecting);
        self.engine.open(&target, &self.config.options);
        self.apply_volume();
    }

    fn apply_volume(&mut self) {
        let volume = if self.muted { 0.0 } else { self.volume };
        self.engine.set_volume(volume);
    }

    fn on_playing(&mut self) {
        if let Some(session) = self.core.session.as_mut() {
            session.attempt = 0;
            session.ever_active = true;
            session.suppress_disconnect_events = false;
        }
        self.core.timers.cancel(TimerKind::Reconnect);
        self.core.transition(SessionState::Active);
    }

    fn retry_policy(&self) -> BackoffPolicy {
        let dropped = self.core.session.as_ref().map(|s| s.ever_active).unwrap_or(false);
        if dropped {
            self.config.drop_retry
        } else {
            self.config.connect_retry
        }
    }

    fn on_failure(&mut self, error: SessionError) {
        let state = self.core.state;
        if !matches!(state, SessionState::Connecting | SessionState::Active) {
            debug!("Ignoring '{}' in {:?}", error, state);
            return;
        }
        let Some(session) = self.core.session.as_ref() else {
            return;
        };
        if session.suppress_disconnect_events || !session.stay_active {
            debug!("Ignoring '{}' during teardown", error);
            return;
        }

        if error.class() != FailureClass::Transient {
            error!("Playback failed: {}", error);
            self.engine.stop();
            self.core.emit(SessionEvent::PlayerError {
                msg: error.to_string(),
            });
            self.core.transition(SessionState::Failed);
            return;
        }

        let first = session.attempt == 0;
        let policy = self.retry_policy();
        match self.core.next_retry(&policy) {
            RetryDecision::Retry { attempt, delay } => {
                warn!(
                    "{}; retry {}/{} in {} ms",
                    error,
                    attempt,
                    policy.max_retries,
                    delay.as_millis()
                );
                if first {
                    self.core.emit(SessionEvent::PlayerError {
                        msg: error.to_string(),
                    });
                }
                if let Some(session) = self.core.session.as_mut() {
                    session.attempt = attempt;
                }
                self.core.emit(SessionEvent::ReconnectAttempt {
                    attempt,
                    max_retries: policy.max_retries,
                });
                self.engine.stop();
                self.core.transition(SessionState::Reconnecting);
                self.core.timers.arm(TimerKind::Reconnect, delay);
            }
            RetryDecision::Exhausted { attempts } => {
                error!("{}; giving up after {} attempts", error, attempts);
                if let Some(session) = self.core.session.as_mut() {
                    session.attempt = attempts;
                }
                self.engine.stop();
                self.core.emit(SessionEvent::ReconnectExhausted { attempts });
                self.core.emit(SessionEvent::PlayerError {
                    msg: RECONNECT_FAILED.to_string(),
                });
                self.core.transition(SessionState::Failed);
            }
        }
    }

    fn fail(&mut self, error: SessionError) {
        error!("Cannot play: {}", error);
        self.core.release_suppression();
        self.core.emit(SessionEvent::PlayerError {
            msg: error.to_string(),
        });
        self.core.transition(SessionState::Failed);
    }

    fn pause(&mut self) {
        if self.core.state != SessionState::Active {
            debug!("Nothing to pause in {:?}", self.core.state);
            return;
        }
        self.engine.pause();
        self.core.paused = Some(PauseReason::User);
        self.core.transition(SessionState::Paused);
    }

    fn resume(&mut self) {
        if self.core.state != SessionState::Paused || self.core.paused != Some(PauseReason::User) {
            debug!("Nothing to resume");
            return;
        }
        // Re-open to jump to the live edge
        self.engine.stop();
        self.open();
    }

    fn stop(&mut self) {
        if !self.core.begin_stop() {
            return;
        }
        self.engine.stop();
        self.core.finish_stop();
    }

    fn background(&mut self) {
        if self.backgrounded {
            return;
        }
        self.backgrounded = true;
        info!("Player entering background");

        match self.core.state {
            SessionState::Active | SessionState::Connecting | SessionState::Reconnecting => {
                if let Some(session) = self.core.session.as_mut() {
                    session.suppress_disconnect_events = true;
                    session.resume = session.stay_active;
                }
                self.core.timers.cancel(TimerKind::Reconnect);
                self.engine.stop();
                self.core.transition(SessionState::Paused);
                self.core.paused = Some(PauseReason::Background);
            }
            SessionState::Paused => {
                self.core.timers.cancel(TimerKind::ResumeSettle);
            }
            _ => {}
        }
    }

    fn foreground(&mut self) {
        if !self.backgrounded {
            return;
        }
        self.backgrounded = false;
        info!("Player returning to foreground");

        let resume = self.core.state == SessionState::Paused
            && self.core.paused == Some(PauseReason::Background)
            && self.core.session.as_ref().map(|s| s.resume).unwrap_or(false);
        if resume {
            self.core
                .timers
                .arm(TimerKind::ResumeSettle, self.lifecycle.resume_settle());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::{LoopbackPlayer, LoopbackPlayerControl, PlayerCall};
    use std::time::Duration;

    const TARGET: &str = "rtsp://media.example.com:8554/live/cam1";

    fn test_config() -> Config {
        let mut config = Config::default();
        config.player.url = "rtsp://media.example.com:8554/live".to_string();
        config.player.stream_name = "cam1".to_string();
        config
    }

    fn spawn(auto_play: bool) -> (PlayerHandle, LoopbackPlayerControl) {
        let (engine, control) = LoopbackPlayer::new();
        let engine = if auto_play { engine.with_auto_play() } else { engine };
        let handle = spawn_player(InstanceId(7), &test_config(), Box::new(engine));
        (handle, control)
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn states(events: &[SessionEvent]) -> Vec<StreamState> {
        events.iter().filter_map(|e| e.state()).collect()
    }

    fn opens(calls: &[PlayerCall]) -> usize {
        calls
            .iter()
            .filter(|c| matches!(c, PlayerCall::Open(_)))
            .count()
    }

    async fn settle(handle: &PlayerHandle) -> SessionSnapshot {
        handle.snapshot().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_play_opens_once() {
        let (handle, mut control) = spawn(true);
        let mut rx = handle.subscribe();

        handle.play(None);
        handle.play(None);
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.play(None);
        settle(&handle).await;

        let calls = control.drain_calls();
        assert_eq!(opens(&calls), 1);
        assert_eq!(calls[0], PlayerCall::Open(TARGET.to_string()));
        assert_eq!(
            states(&drain(&mut rx)),
            vec![StreamState::Connecting, StreamState::Playing]
        );

        // Outside the window but already playing: still a no-op
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.play(None);
        settle(&handle).await;
        assert_eq!(opens(&control.drain_calls()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffering_while_playing_is_reported() {
        let (handle, control) = spawn(true);
        let mut rx = handle.subscribe();

        handle.play(None);
        settle(&handle).await;
        drain(&mut rx);

        control.emit(PlayerCallback::Buffering);
        control.emit(PlayerCallback::Buffering);
        control.emit(PlayerCallback::Playing);
        settle(&handle).await;

        assert_eq!(
            states(&drain(&mut rx)),
            vec![StreamState::Buffering, StreamState::Playing]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_error_uses_generic_policy() {
        let (handle, mut control) = spawn(false);
        let mut rx = handle.subscribe();
        let start = Instant::now();

        handle.play(None);
        control.wait_for(|c| matches!(c, PlayerCall::Open(_))).await;
        control.emit(PlayerCallback::Error {
            msg: "Connection refused".to_string(),
        });
        settle(&handle).await;

        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::StateChanged {
                    state: StreamState::Connecting
                },
                SessionEvent::PlayerError {
                    msg: "Connection failed: Connection refused".to_string()
                },
                SessionEvent::ReconnectAttempt {
                    attempt: 1,
                    max_retries: 5
                },
                SessionEvent::StateChanged {
                    state: StreamState::Buffering
                },
            ]
        );

        control.wait_for(|c| matches!(c, PlayerCall::Open(_))).await;
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_playback_drop_uses_bounded_policy() {
        let (handle, mut control) = spawn(true);
        let mut rx = handle.subscribe();

        handle.play(None);
        settle(&handle).await;
        control.set_auto_play(false);
        control.drain_calls();
        drain(&mut rx);

        let start = Instant::now();
        control.emit(PlayerCallback::Ended);
        control.wait_for(|c| matches!(c, PlayerCall::Open(_))).await;
        assert_eq!(start.elapsed(), Duration::from_millis(5000));

        control.emit(PlayerCallback::Error {
            msg: "timeout".to_string(),
        });
        control.wait_for(|c| matches!(c, PlayerCall::Open(_))).await;
        assert_eq!(start.elapsed(), Duration::from_millis(10000));

        control.emit(PlayerCallback::Error {
            msg: "timeout".to_string(),
        });
        let snapshot = settle(&handle).await;
        assert_eq!(snapshot.state, SessionState::Failed);
        assert_eq!(snapshot.pending_timers, 0);

        let events = drain(&mut rx);
        assert!(events.contains(&SessionEvent::ReconnectAttempt {
            attempt: 1,
            max_retries: 3
        }));
        assert!(events.contains(&SessionEvent::ReconnectExhausted { attempts: 3 }));
        assert_eq!(
            states(&events),
            vec![StreamState::Buffering, StreamState::Failed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_does_not_retry() {
        let (handle, control) = spawn(false);
        let mut rx = handle.subscribe();

        handle.play(None);
        settle(&handle).await;
        drain(&mut rx);
        control.emit(PlayerCallback::Error {
            msg: "403 Forbidden".to_string(),
        });
        let snapshot = settle(&handle).await;

        assert_eq!(snapshot.state, SessionState::Failed);
        assert_eq!(snapshot.pending_timers, 0);
        assert_eq!(states(&drain(&mut rx)), vec![StreamState::Failed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_reopen_live_edge() {
        let (handle, mut control) = spawn(true);
        let mut rx = handle.subscribe();

        handle.play(None);
        settle(&handle).await;
        control.drain_calls();
        drain(&mut rx);

        handle.pause();
        handle.resume();
        settle(&handle).await;

        let calls = control.drain_calls();
        assert_eq!(calls[0], PlayerCall::Pause);
        assert_eq!(calls[1], PlayerCall::Stop);
        assert_eq!(calls[2], PlayerCall::Open(TARGET.to_string()));
        assert_eq!(
            states(&drain(&mut rx)),
            vec![
                StreamState::Paused,
                StreamState::Connecting,
                StreamState::Playing
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_foreground_reopens_silently() {
        let (handle, mut control) = spawn(true);
        let mut rx = handle.subscribe();

        handle.play(None);
        settle(&handle).await;
        control.drain_calls();
        drain(&mut rx);

        handle.background();
        handle.foreground();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let snapshot = settle(&handle).await;

        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(opens(&control.drain_calls()), 1);
        assert!(states(&drain(&mut rx)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_while_backgrounded_waits_for_foreground() {
        let (handle, mut control) = spawn(true);
        let mut rx = handle.subscribe();

        handle.background();
        handle.play(None);
        let snapshot = settle(&handle).await;
        assert_eq!(snapshot.state, SessionState::Paused);
        assert_eq!(snapshot.paused, Some(PauseReason::Background));
        assert_eq!(opens(&control.drain_calls()), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(opens(&control.drain_calls()), 0);

        handle.foreground();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let snapshot = settle(&handle).await;
        assert_eq!(snapshot.state, SessionState::Active);

        let calls = control.drain_calls();
        assert_eq!(opens(&calls), 1);
        assert!(calls.contains(&PlayerCall::Open(TARGET.to_string())));
        assert_eq!(
            states(&drain(&mut rx)).last(),
            Some(&StreamState::Playing)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_is_clamped_and_muting_is_reapplied() {
        let (handle, mut control) = spawn(true);

        handle.set_volume(2.5);
        handle.set_muted(true);
        handle.play(None);
        settle(&handle).await;

        let calls = control.drain_calls();
        assert_eq!(calls[0], PlayerCall::SetVolume(1.0));
        assert_eq!(calls[1], PlayerCall::SetVolume(0.0));
        assert_eq!(calls[2], PlayerCall::Open(TARGET.to_string()));
        assert_eq!(calls[3], PlayerCall::SetVolume(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeline_queries() {
        let (handle, control) = spawn(true);
        control.set_timeline(42_000, 600_000);

        assert_eq!(handle.position().await, Some(42_000));
        assert_eq!(handle.duration().await, Some(600_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_retry_leaves_no_timers() {
        let (handle, mut control) = spawn(false);
        let mut rx = handle.subscribe();

        handle.play(None);
        control.wait_for(|c| matches!(c, PlayerCall::Open(_))).await;
        control.emit(PlayerCallback::Error {
            msg: "Connection refused".to_string(),
        });
        assert_eq!(settle(&handle).await.pending_timers, 1);

        handle.stop();
        let snapshot = settle(&handle).await;
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.pending_timers, 0);
        assert_eq!(states(&drain(&mut rx)).last(), Some(&StreamState::Stopped));

        control.drain_calls();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(opens(&control.drain_calls()), 0);
    }
}
