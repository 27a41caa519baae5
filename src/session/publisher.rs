//! Publisher session actor
//!
//! Owns the publisher engine, the capture device coordinator and the
//! fan-out manager of one instance and runs their state machine on a
//! single task.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn, Instrument};

use super::{
    owner_span, record_session, resolve_target, InstanceId, PauseReason, RetryDecision, Role,
    Session, SessionCore, SessionSnapshot, SessionState, RECONNECT_FAILED,
};
use crate::config::{Config, LifecycleConfig, PublisherConfig};
use crate::device::{normalize_filter, DeviceCoordinator, Facing};
use crate::engine::{DestinationConnector, PublisherCallback, PublisherEngine};
use crate::error::{FailureClass, SessionError, SwitchError};
use crate::events::{EventBridge, SessionEvent, StreamState};
use crate::fanout::FanoutManager;
use crate::stats::{StatsTracker, StreamStatistics};
use crate::timer::{TimerFired, TimerInvalidator, TimerKind, TimerSet};

/// Commands accepted by a publisher instance
#[derive(Debug)]
pub enum PublisherCommand {
    /// Start streaming to `url` (or the configured URL)
    Start { url: Option<String> },
    Stop,
    /// Re-attach the camera for local preview
    StartPreview,
    SwitchCamera {
        reply: Option<oneshot::Sender<Result<Facing, SwitchError>>>,
    },
    ToggleFlash,
    ToggleMute,
    SetZoom(f32),
    SetExposure(f32),
    SetFilter(String),
    StartMulti(Vec<String>),
    StopMulti,
    StartRecording {
        reply: oneshot::Sender<Option<PathBuf>>,
    },
    StopRecording,
    Background,
    Foreground,
    Acknowledge,
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Statistics {
        reply: oneshot::Sender<StreamStatistics>,
    },
    Shutdown,
}

/// Cloneable handle to a running publisher instance. Every method is
/// fire-and-forget; on an instance that no longer exists it does nothing.
#[derive(Clone)]
pub struct PublisherHandle {
    instance: InstanceId,
    cmd_tx: mpsc::UnboundedSender<PublisherCommand>,
    events: broadcast::Sender<SessionEvent>,
    invalidator: TimerInvalidator,
}

impl PublisherHandle {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Events as a stream; lagged receivers yield an error item
    pub fn events(&self) -> BroadcastStream<SessionEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    fn send(&self, cmd: PublisherCommand) {
        if let Err(e) = self.cmd_tx.send(cmd) {
            debug!("Publisher {} is gone; dropping {:?}", self.instance, e.0);
        }
    }

    pub fn start(&self, url: Option<&str>) {
        self.send(PublisherCommand::Start {
            url: url.map(str::to_string),
        });
    }

    /// Every pending timer is void once this returns; teardown follows on the owner task
    pub fn stop(&self) {
        self.invalidator.invalidate();
        self.send(PublisherCommand::Stop);
    }

    pub fn start_preview(&self) {
        self.send(PublisherCommand::StartPreview);
    }

    pub fn switch_camera(&self) {
        self.send(PublisherCommand::SwitchCamera { reply: None });
    }

    /// Like [`Self::switch_camera`] but reports the new facing or the rejection.
    /// `None` if the instance is gone.
    pub async fn switch_camera_checked(&self) -> Option<Result<Facing, SwitchError>> {
        let (tx, rx) = oneshot::channel();
        self.send(PublisherCommand::SwitchCamera { reply: Some(tx) });
        rx.await.ok()
    }

    pub fn toggle_flash(&self) {
        self.send(PublisherCommand::ToggleFlash);
    }

    pub fn toggle_mute(&self) {
        self.send(PublisherCommand::ToggleMute);
    }

    pub fn set_zoom(&self, level: f32) {
        self.send(PublisherCommand::SetZoom(level));
    }

    pub fn set_exposure(&self, value: f32) {
        self.send(PublisherCommand::SetExposure(value));
    }

    pub fn set_filter(&self, name: &str) {
        self.send(PublisherCommand::SetFilter(name.to_string()));
    }

    pub fn start_multi(&self, urls: Vec<String>) {
        self.send(PublisherCommand::StartMulti(urls));
    }

    pub fn stop_multi(&self) {
        self.send(PublisherCommand::StopMulti);
    }

    /// Path of the new (or already running) recording
    pub async fn start_recording(&self) -> Option<PathBuf> {
        let (tx, rx) = oneshot::channel();
        self.send(PublisherCommand::StartRecording { reply: tx });
        rx.await.ok().flatten()
    }

    pub fn stop_recording(&self) {
        self.send(PublisherCommand::StopRecording);
    }

    pub fn background(&self) {
        self.send(PublisherCommand::Background);
    }

    pub fn foreground(&self) {
        self.send(PublisherCommand::Foreground);
    }

    pub fn acknowledge(&self) {
        self.send(PublisherCommand::Acknowledge);
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(PublisherCommand::Snapshot { reply: tx });
        rx.await.ok()
    }

    pub async fn statistics(&self) -> Option<StreamStatistics> {
        let (tx, rx) = oneshot::channel();
        self.send(PublisherCommand::Statistics { reply: tx });
        rx.await.ok()
    }

    /// Stop the session and end the owner task
    pub fn shutdown(&self) {
        self.invalidator.invalidate();
        self.send(PublisherCommand::Shutdown);
    }

    /// Resolves once the owner task has exited
    pub async fn closed(&self) {
        self.cmd_tx.closed().await
    }
}

/// Spawn a publisher instance on the current runtime
pub fn spawn_publisher(
    instance: InstanceId,
    config: &Config,
    engine: Box<dyn PublisherEngine>,
    connector: Arc<dyn DestinationConnector>,
) -> PublisherHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let (callback_tx, callback_rx) = mpsc::unbounded_channel();

    let timers = TimerSet::new(timer_tx);
    let invalidator = timers.invalidator();
    let bridge = EventBridge::new(config.event_capacity);
    let events = bridge.sender();
    let notifier = bridge.notifier();

    let mut engine = engine;
    engine.bind(callback_tx);

    let facing = if config.publisher.front_camera {
        Facing::Front
    } else {
        Facing::Back
    };
    let device = DeviceCoordinator::new(
        facing,
        config.publisher.encoder_profile(),
        engine.bounce_policy(),
        &config.lifecycle,
    );

    let mut actor = PublisherActor {
        core: SessionCore::new(Role::Publisher, instance, timers, bridge),
        config: config.publisher.clone(),
        lifecycle: config.lifecycle.clone(),
        engine,
        device,
        fanout: FanoutManager::new(connector, &config.fanout, notifier),
        stats: StatsTracker::new(),
        recording: None,
        cmd_rx,
        timer_rx,
        callback_rx,
    };
    actor.start_preview();

    tokio::spawn(actor.run().instrument(owner_span(Role::Publisher, instance)));

    PublisherHandle {
        instance,
        cmd_tx,
        events,
        invalidator,
    }
}

struct PublisherActor {
    core: SessionCore,
    config: PublisherConfig,
    lifecycle: LifecycleConfig,
    engine: Box<dyn PublisherEngine>,
    device: DeviceCoordinator,
    fanout: FanoutManager,
    stats: StatsTracker,
    recording: Option<PathBuf>,
    cmd_rx: mpsc::UnboundedReceiver<PublisherCommand>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    callback_rx: mpsc::UnboundedReceiver<PublisherCallback>,
}

impl PublisherActor {
    async fn run(mut self) {
        info!("Publisher {} started", self.core.instance);

        loop {
            tokio::select! {
                biased;

                // Engine callbacks first so they are seen in the order the
                // commands that caused them were issued
                Some(callback) = self.callback_rx.recv() => {
                    self.handle_callback(callback);
                }

                Some(fired) = self.timer_rx.recv() => {
                    self.handle_timer(fired);
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(PublisherCommand::Shutdown) | None => {
                            self.stop();
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
            }
        }

        self.fanout.stop();
        self.device.detach(self.engine.as_mut());
        info!("Publisher {} shut down", self.core.instance);
    }

    fn handle_command(&mut self, cmd: PublisherCommand) {
        match cmd {
            PublisherCommand::Start { url } => self.start(url),
            PublisherCommand::Stop => self.stop(),
            PublisherCommand::StartPreview => self.start_preview(),
            PublisherCommand::SwitchCamera { reply } => {
                let result = self.switch_camera();
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            PublisherCommand::ToggleFlash => {
                let on = self.device.toggle_torch(self.engine.as_mut());
                debug!("Flash {}", if on { "on" } else { "off" });
            }
            PublisherCommand::ToggleMute => {
                let muted = self.device.toggle_mute(self.engine.as_mut());
                info!("Microphone {}", if muted { "muted" } else { "unmuted" });
            }
            PublisherCommand::SetZoom(level) => {
                if self.device.state().attached {
                    self.engine.set_zoom(level.clamp(0.0, 1.0));
                }
            }
            PublisherCommand::SetExposure(value) => {
                if self.device.state().attached {
                    self.engine.set_exposure(value.clamp(-1.0, 1.0));
                }
            }
            PublisherCommand::SetFilter(name) => {
                if self.device.state().attached {
                    let filter = normalize_filter(&name);
                    debug!("Filter {:?} -> {}", name, filter);
                    self.engine.set_filter(filter);
                }
            }
            PublisherCommand::StartMulti(urls) => {
                let live = self.core.state == SessionState::Active;
                self.fanout.start(&urls, live);
            }
            PublisherCommand::StopMulti => self.fanout.stop(),
            PublisherCommand::StartRecording { reply } => {
                let _ = reply.send(self.start_recording());
            }
            PublisherCommand::StopRecording => self.stop_recording(),
            PublisherCommand::Background => self.background(),
            PublisherCommand::Foreground => self.foreground(),
            PublisherCommand::Acknowledge => {
                if self.core.state.is_live() || self.core.state == SessionState::Paused {
                    debug!("Acknowledge ignored while {:?}", self.core.state);
                } else {
                    self.core.acknowledge();
                }
            }
            PublisherCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PublisherCommand::Statistics { reply } => {
                let _ = reply.send(self.stats.snapshot(self.fanout.urls().len()));
            }
            PublisherCommand::Shutdown => {}
        }
    }

    fn handle_timer(&mut self, fired: TimerFired) {
        if !self.core.timers.accept(fired) {
            return;
        }

        match fired.kind {
            TimerKind::Reconnect => {
                if self.core.state == SessionState::Reconnecting {
                    self.reconnect();
                }
            }
            TimerKind::ResumeSettle => {
                if self.core.state == SessionState::Paused {
                    self.resume_after_foreground();
                }
            }
            TimerKind::BounceRestart => {
                if self.core.state == SessionState::Reconnecting {
                    info!("Restarting stream after camera switch");
                    self.reconnect();
                    self.clear_suppression();
                }
            }
            TimerKind::SwitchSettle => self.device.finish_switch(),
            TimerKind::KeyFrame(checkpoint) => {
                if self.core.state == SessionState::Active {
                    debug!("Key frame checkpoint {}", checkpoint);
                    self.engine.request_key_frame();
                }
            }
        }
    }

    fn handle_callback(&mut self, callback: PublisherCallback) {
        match callback {
            PublisherCallback::ConnectionStarted { uri } => {
                debug!("Connection started: {}", uri);
            }
            PublisherCallback::ConnectionSuccess => self.on_connected(),
            PublisherCallback::ConnectionFailed { reason } => {
                let error = SessionError::classify(&reason);
                self.on_failure(error);
            }
            PublisherCallback::AuthError => {
                self.on_failure(SessionError::AuthError("Authentication failed".to_string()));
            }
            PublisherCallback::Disconnected => {
                let error = match self.core.state {
                    SessionState::Active => SessionError::StreamLost("Disconnected".to_string()),
                    _ => SessionError::ConnectFailed("Disconnected".to_string()),
                };
                self.on_failure(error);
            }
            PublisherCallback::Bitrate { bytes_per_second } => {
                if self.core.session.is_some() {
                    let bps = bytes_per_second.saturating_mul(8);
                    self.stats.on_bitrate(bps);
                    self.core.emit(SessionEvent::BitrateUpdate { bps });
                }
            }
            PublisherCallback::Frame(frame) => {
                if self.core.state == SessionState::Active {
                    self.fanout.offer(&frame);
                }
            }
        }
    }

    fn start_preview(&mut self) {
        if self.device.state().backgrounded {
            return;
        }
        let facing = self.device.state().facing;
        let result = self
            .device
            .prepare(self.engine.as_mut())
            .and_then(|_| self.device.attach(self.engine.as_mut(), facing));
        if let Err(e) = result {
            warn!("Camera preview unavailable: {}", e);
        }
    }

    fn start(&mut self, url: Option<String>) {
        if self.core.session.is_some() {
            info!("Replacing current session");
            self.stop();
        }
        self.core.timers.cancel_all();
        self.core.acknowledge();

        let base = url.unwrap_or_else(|| self.config.url.clone());
        let target = match resolve_target(&base, &self.config.stream_key) {
            Ok(target) => target,
            Err(e) => return self.fail(e),
        };
        if !self.device.state().attached {
            return self.fail(SessionError::DeviceNotReady);
        }

        let session = Session::new(target);
        record_session(&session.id);
        info!("Publishing session {} -> {}", session.id, session.target);
        self.core.session = Some(session);
        self.core.transition(SessionState::Initializing);

        if let Err(e) = self.device.prepare(self.engine.as_mut()) {
            return self.fail(e.into());
        }
        self.core.transition(SessionState::Ready);
        self.connect();
    }

    /// Enter Connecting and issue exactly one connect
    fn connect(&mut self) {
        let Some(target) = self.core.target() else {
            return;
        };
        self.core.transition(SessionState::Connecting);
        self.engine.connect(&target);
        self.engine.set_muted(self.device.state().muted);
    }

    /// Retry after a failure: parameters are re-prepared first
    fn reconnect(&mut self) {
        if !self.device.state().attached {
            return self.fail(SessionError::DeviceNotReady);
        }
        if let Err(e) = self.device.prepare(self.engine.as_mut()) {
            return self.fail(e.into());
        }
        self.connect();
    }

    fn on_connected(&mut self) {
        if self.core.state != SessionState::Connecting {
            debug!("Ignoring connection success in {:?}", self.core.state);
            return;
        }

        self.core.emit(SessionEvent::ConnectionSuccess);
        if let Some(session) = self.core.session.as_mut() {
            session.attempt = 0;
            session.ever_active = true;
            session.suppress_disconnect_events = false;
        }
        self.core.timers.cancel(TimerKind::Reconnect);
        self.core.transition(SessionState::Active);
        self.stats.on_active();
        self.fanout.on_primary_active();
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

        self.stats.on_inactive();

        if error.class() != FailureClass::Transient {
            error!("Publishing failed: {}", error);
            if state == SessionState::Active {
                self.engine.disconnect();
            }
            self.stop_recording();
            self.fanout.disconnect();
            self.core.emit(SessionEvent::ConnectionFailed {
                msg: error.to_string(),
            });
            self.core.transition(SessionState::Failed);
            return;
        }

        let first = session.attempt == 0;
        match self.core.next_retry(&self.config.reconnect) {
            RetryDecision::Retry { attempt, delay } => {
                warn!(
                    "{}; retry {}/{} in {} ms",
                    error,
                    attempt,
                    self.config.reconnect.max_retries,
                    delay.as_millis()
                );
                if first {
                    match &error {
                        SessionError::StreamLost(_) => {
                            self.core.emit(SessionEvent::Disconnect);
                            self.core.bridge.state(StreamState::Disconnected);
                        }
                        _ => self.core.emit(SessionEvent::ConnectionFailed {
                            msg: error.to_string(),
                        }),
                    }
                }
                if let Some(session) = self.core.session.as_mut() {
                    session.attempt = attempt;
                }
                // Secondaries reconnect once the primary is live again
                self.fanout.disconnect();
                self.core.emit(SessionEvent::ReconnectAttempt {
                    attempt,
                    max_retries: self.config.reconnect.max_retries,
                });
                self.core.transition(SessionState::Reconnecting);
                self.core.timers.arm(TimerKind::Reconnect, delay);
            }
            RetryDecision::Exhausted { attempts } => {
                error!("{}; giving up after {} attempts", error, attempts);
                if let Some(session) = self.core.session.as_mut() {
                    session.attempt = attempts;
                }
                self.core.emit(SessionEvent::ReconnectExhausted { attempts });
                self.core.emit(SessionEvent::ConnectionFailed {
                    msg: RECONNECT_FAILED.to_string(),
                });
                self.core.transition(SessionState::Failed);
                self.fanout.disconnect();
            }
        }
    }

    /// Fatal failure: report and park in Failed. Always visible, even in
    /// the middle of a suppressed background resume or bounce.
    fn fail(&mut self, error: SessionError) {
        error!("Cannot publish: {}", error);
        self.core.release_suppression();
        self.stats.on_inactive();
        self.fanout.disconnect();
        self.core.emit(SessionEvent::ConnectionFailed {
            msg: error.to_string(),
        });
        self.core.transition(SessionState::Failed);
    }

    fn stop(&mut self) {
        let state = self.core.state;
        let was_connected = matches!(state, SessionState::Connecting | SessionState::Active);

        if !self.core.begin_stop() {
            self.device.finish_switch();
            return;
        }

        self.stop_recording();
        self.fanout.on_session_stopped();
        if was_connected {
            self.engine.disconnect();
        }
        self.stats.reset();
        self.device.finish_switch();

        // Release the encoder, then bring the camera back for preview only
        if !self.device.state().backgrounded {
            self.device.detach(self.engine.as_mut());
            self.start_preview();
        }

        if state == SessionState::Active {
            self.core.emit(SessionEvent::Disconnect);
        }
        self.core.finish_stop();
    }

    fn switch_camera(&mut self) -> Result<Facing, SwitchError> {
        let streaming = self.core.state == SessionState::Active;
        let plan = match self.device.begin_switch(streaming) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("Camera switch rejected: {}", e);
                return Err(e);
            }
        };

        if plan.bounce {
            info!("Bouncing stream for camera switch {:?} -> {:?}", plan.from, plan.to);
            if let Some(session) = self.core.session.as_mut() {
                session.suppress_disconnect_events = true;
            }
            self.engine.disconnect();
            self.stats.on_inactive();
            self.core.transition(SessionState::Reconnecting);
            if let Err(e) = self.device.apply_switch(self.engine.as_mut(), &plan) {
                warn!("Camera switch failed during bounce: {}", e);
                self.device.finish_switch();
                self.fail(e.clone().into());
                return Err(e.into());
            }
            self.core
                .timers
                .arm(TimerKind::BounceRestart, self.lifecycle.bounce_settle());
        } else {
            if let Err(e) = self.device.apply_switch(self.engine.as_mut(), &plan) {
                self.device.finish_switch();
                return Err(e.into());
            }
            for (index, delay) in plan.key_frame_checkpoints.iter().enumerate() {
                self.core
                    .timers
                    .arm(TimerKind::KeyFrame(index as u8), *delay);
            }
        }

        self.core.timers.arm(TimerKind::SwitchSettle, plan.settle);
        Ok(plan.to)
    }

    fn background(&mut self) {
        if self.device.state().backgrounded {
            debug!("Already in background");
            return;
        }
        info!("Entering background");

        match self.core.state {
            SessionState::Active | SessionState::Connecting | SessionState::Reconnecting => {
                let connected = self.core.state != SessionState::Reconnecting;
                if let Some(session) = self.core.session.as_mut() {
                    session.suppress_disconnect_events = true;
                    session.resume = session.stay_active;
                }
                self.core.timers.cancel(TimerKind::Reconnect);
                self.core.timers.cancel(TimerKind::BounceRestart);
                if connected {
                    self.engine.disconnect();
                }
                self.stop_recording();
                self.fanout.disconnect();
                self.stats.on_inactive();
                self.core.transition(SessionState::Paused);
                self.core.paused = Some(PauseReason::Background);
            }
            SessionState::Paused => {
                self.core.timers.cancel(TimerKind::ResumeSettle);
            }
            _ => {}
        }

        self.core.timers.cancel(TimerKind::SwitchSettle);
        self.core
            .timers
            .cancel_matching(|kind| matches!(kind, TimerKind::KeyFrame(_)));
        self.device.on_background(self.engine.as_mut());
    }

    fn foreground(&mut self) {
        if !self.device.state().backgrounded {
            debug!("Already in foreground");
            return;
        }
        info!("Returning to foreground");

        if let Err(e) = self.device.on_foreground(self.engine.as_mut()) {
            warn!("Camera unavailable after foreground: {}", e);
        }

        let resume = self.core.state == SessionState::Paused
            && self.core.session.as_ref().map(|s| s.resume).unwrap_or(false);
        if resume {
            self.core
                .timers
                .arm(TimerKind::ResumeSettle, self.lifecycle.resume_settle());
        }
    }

    fn resume_after_foreground(&mut self) {
        info!("Resuming stream");
        if let Some(session) = self.core.session.as_mut() {
            session.attempt = 0;
        }
        self.reconnect();
        self.clear_suppression();
    }

    fn clear_suppression(&mut self) {
        self.core.release_suppression();
    }

    fn start_recording(&mut self) -> Option<PathBuf> {
        if let Some(path) = &self.recording {
            return Some(path.clone());
        }
        if !self.device.state().attached {
            warn!("Cannot record without a camera");
            return None;
        }

        let dir = &self.config.recordings_dir;
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("Failed to create recordings directory {:?}: {}", dir, e);
            return None;
        }
        let path = dir.join(format!("recording_{}.mp4", Utc::now().timestamp_millis()));

        match self.engine.start_recording(&path) {
            Ok(()) => {
                info!("Recording to {:?}", path);
                self.recording = Some(path.clone());
                self.core
                    .emit(SessionEvent::RecordingStarted { path: path.clone() });
                Some(path)
            }
            Err(e) => {
                warn!("Failed to start recording: {:#}", e);
                None
            }
        }
    }

    fn stop_recording(&mut self) {
        if let Some(path) = self.recording.take() {
            self.engine.stop_recording();
            info!("Recording saved to {:?}", path);
            self.core.emit(SessionEvent::RecordingStopped { path });
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device: Some(self.device.state()),
            destinations: self.fanout.statuses(),
            recording: self.recording.clone(),
            ..self.core.snapshot()
        }
    }
}
