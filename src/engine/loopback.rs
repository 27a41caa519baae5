//! In-process engines with no media hardware
//!
//! Record every call the session makes and let the caller inject engine
//! callbacks. Used by the `livecast-agent` demo and by the session tests.

use anyhow::{bail, Result};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    AudioParams, DestinationConnector, DestinationSink, EncodedFrame, FrameKind, PlayerCallback,
    PlayerCallbacks, PlayerEngine, PlayerOptions, PublisherCallback, PublisherCallbacks,
    PublisherEngine, VideoParams,
};
use crate::device::{BouncePolicy, Facing};
use crate::error::{DeviceError, FanoutError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A call made on a [`LoopbackPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherCall {
    PrepareVideo(VideoParams),
    PrepareAudio(AudioParams),
    StartCapture(Facing),
    StopCapture,
    Connect(String),
    Disconnect,
    RequestKeyFrame,
    SetMuted(bool),
    SetTorch(bool),
    SetZoom(f32),
    SetExposure(f32),
    SetFilter(String),
    StartRecording(PathBuf),
    StopRecording,
}

#[derive(Default)]
struct PublisherShared {
    callbacks: Mutex<Option<PublisherCallbacks>>,
    auto_connect: AtomicBool,
    deny_capture: AtomicBool,
    fail_prepare: AtomicBool,
}

impl PublisherShared {
    fn emit(&self, callback: PublisherCallback) -> bool {
        match lock(&self.callbacks).as_ref() {
            Some(tx) => tx.send(callback).is_ok(),
            None => false,
        }
    }
}

pub struct LoopbackPublisher {
    calls: mpsc::UnboundedSender<PublisherCall>,
    shared: Arc<PublisherShared>,
    bounce: BouncePolicy,
    capturing: bool,
}

/// Test/demo side of a [`LoopbackPublisher`]
pub struct LoopbackPublisherControl {
    calls: mpsc::UnboundedReceiver<PublisherCall>,
    shared: Arc<PublisherShared>,
}

impl LoopbackPublisher {
    pub fn new() -> (Self, LoopbackPublisherControl) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PublisherShared::default());
        (
            Self {
                calls: tx,
                shared: shared.clone(),
                bounce: BouncePolicy::HotSwitch,
                capturing: false,
            },
            LoopbackPublisherControl { calls: rx, shared },
        )
    }

    /// Answer every connect with started, success and a first bitrate sample
    pub fn with_auto_connect(self) -> Self {
        self.shared.auto_connect.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_bounce_policy(mut self, bounce: BouncePolicy) -> Self {
        self.bounce = bounce;
        self
    }

    fn record(&self, call: PublisherCall) {
        let _ = self.calls.send(call);
    }
}

impl PublisherEngine for LoopbackPublisher {
    fn bind(&mut self, callbacks: PublisherCallbacks) {
        *lock(&self.shared.callbacks) = Some(callbacks);
    }

    fn prepare_video(&mut self, params: &VideoParams) -> bool {
        self.record(PublisherCall::PrepareVideo(*params));
        !self.shared.fail_prepare.load(Ordering::SeqCst)
    }

    fn prepare_audio(&mut self, params: &AudioParams) -> bool {
        self.record(PublisherCall::PrepareAudio(*params));
        !self.shared.fail_prepare.load(Ordering::SeqCst)
    }

    fn start_capture(&mut self, facing: Facing) -> Result<(), DeviceError> {
        self.record(PublisherCall::StartCapture(facing));
        if self.shared.deny_capture.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied);
        }
        self.capturing = true;
        Ok(())
    }

    fn stop_capture(&mut self) {
        self.capturing = false;
        self.record(PublisherCall::StopCapture);
    }

    fn connect(&mut self, uri: &str) {
        self.record(PublisherCall::Connect(uri.to_string()));
        if self.shared.auto_connect.load(Ordering::SeqCst) {
            self.shared.emit(PublisherCallback::ConnectionStarted {
                uri: uri.to_string(),
            });
            self.shared.emit(PublisherCallback::ConnectionSuccess);
            self.shared.emit(PublisherCallback::Bitrate {
                bytes_per_second: 250_000,
            });
        }
    }

    fn disconnect(&mut self) {
        self.record(PublisherCall::Disconnect);
    }

    fn request_key_frame(&mut self) {
        self.record(PublisherCall::RequestKeyFrame);
    }

    fn set_muted(&mut self, muted: bool) {
        self.record(PublisherCall::SetMuted(muted));
    }

    fn set_torch(&mut self, on: bool) -> bool {
        self.record(PublisherCall::SetTorch(on));
        self.capturing
    }

    fn set_zoom(&mut self, level: f32) {
        self.record(PublisherCall::SetZoom(level));
    }

    fn set_exposure(&mut self, value: f32) {
        self.record(PublisherCall::SetExposure(value));
    }

    fn set_filter(&mut self, name: &str) {
        self.record(PublisherCall::SetFilter(name.to_string()));
    }

    fn start_recording(&mut self, path: &Path) -> Result<()> {
        self.record(PublisherCall::StartRecording(path.to_path_buf()));
        if !self.capturing {
            bail!("Nothing to record: capture is not running");
        }
        Ok(())
    }

    fn stop_recording(&mut self) {
        self.record(PublisherCall::StopRecording);
    }

    fn bounce_policy(&self) -> BouncePolicy {
        self.bounce.clone()
    }
}

impl LoopbackPublisherControl {
    /// Inject an engine callback. Returns false if the engine is not bound.
    pub fn emit(&self, callback: PublisherCallback) -> bool {
        self.shared.emit(callback)
    }

    /// Emit one synthetic encoded frame
    pub fn emit_frame(&self, pts_us: u64, key_frame: bool) -> bool {
        self.emit(PublisherCallback::Frame(EncodedFrame {
            kind: FrameKind::Video,
            pts_us,
            key_frame,
            data: Arc::from(vec![0u8; 64]),
        }))
    }

    pub fn set_auto_connect(&self, on: bool) {
        self.shared.auto_connect.store(on, Ordering::SeqCst);
    }

    pub fn set_deny_capture(&self, on: bool) {
        self.shared.deny_capture.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_prepare(&self, on: bool) {
        self.shared.fail_prepare.store(on, Ordering::SeqCst);
    }

    pub async fn next_call(&mut self) -> Option<PublisherCall> {
        self.calls.recv().await
    }

    pub fn try_next_call(&mut self) -> Option<PublisherCall> {
        self.calls.try_recv().ok()
    }

    /// Skip calls until one matches
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Option<PublisherCall>
    where
        F: FnMut(&PublisherCall) -> bool,
    {
        while let Some(call) = self.calls.recv().await {
            if pred(&call) {
                return Some(call);
            }
        }
        None
    }

    /// Every call recorded so far
    pub fn drain_calls(&mut self) -> Vec<PublisherCall> {
        let mut calls = Vec::new();
        while let Ok(call) = self.calls.try_recv() {
            calls.push(call);
        }
        calls
    }
}

/// A call made on a [`LoopbackPlayer`]
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCall {
    Open(String),
    Stop,
    Pause,
    Seek(u64),
    SetRate(f32),
    SetVolume(f32),
}

#[derive(Default)]
struct PlayerShared {
    callbacks: Mutex<Option<PlayerCallbacks>>,
    auto_play: AtomicBool,
    position_ms: AtomicU64,
    duration_ms: AtomicU64,
}

impl PlayerShared {
    fn emit(&self, callback: PlayerCallback) -> bool {
        match lock(&self.callbacks).as_ref() {
            Some(tx) => tx.send(callback).is_ok(),
            None => false,
        }
    }
}

pub struct LoopbackPlayer {
    calls: mpsc::UnboundedSender<PlayerCall>,
    shared: Arc<PlayerShared>,
}

/// Test/demo side of a [`LoopbackPlayer`]
pub struct LoopbackPlayerControl {
    calls: mpsc::UnboundedReceiver<PlayerCall>,
    shared: Arc<PlayerShared>,
}

impl LoopbackPlayer {
    pub fn new() -> (Self, LoopbackPlayerControl) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PlayerShared::default());
        (
            Self {
                calls: tx,
                shared: shared.clone(),
            },
            LoopbackPlayerControl { calls: rx, shared },
        )
    }

    /// Answer every open with connecting, buffering and playing
    pub fn with_auto_play(self) -> Self {
        self.shared.auto_play.store(true, Ordering::SeqCst);
        self
    }

    fn record(&self, call: PlayerCall) {
        let _ = self.calls.send(call);
    }
}

impl PlayerEngine for LoopbackPlayer {
    fn bind(&mut self, callbacks: PlayerCallbacks) {
        *lock(&self.shared.callbacks) = Some(callbacks);
    }

    fn open(&mut self, uri: &str, options: &PlayerOptions) {
        debug!(
            "loopback open {} (network cache {} ms)",
            uri, options.network_caching_ms
        );
        self.record(PlayerCall::Open(uri.to_string()));
        if self.shared.auto_play.load(Ordering::SeqCst) {
            self.shared.emit(PlayerCallback::Connecting);
            self.shared.emit(PlayerCallback::Buffering);
            self.shared.emit(PlayerCallback::Playing);
        }
    }

    fn stop(&mut self) {
        self.shared.position_ms.store(0, Ordering::SeqCst);
        self.record(PlayerCall::Stop);
    }

    fn pause(&mut self) {
        self.record(PlayerCall::Pause);
    }

    fn seek(&mut self, position_ms: u64) {
        self.shared.position_ms.store(position_ms, Ordering::SeqCst);
        self.record(PlayerCall::Seek(position_ms));
    }

    fn set_rate(&mut self, rate: f32) {
        self.record(PlayerCall::SetRate(rate));
    }

    fn set_volume(&mut self, volume: f32) {
        self.record(PlayerCall::SetVolume(volume));
    }

    fn position_ms(&self) -> u64 {
        self.shared.position_ms.load(Ordering::SeqCst)
    }

    fn duration_ms(&self) -> u64 {
        self.shared.duration_ms.load(Ordering::SeqCst)
    }
}

impl LoopbackPlayerControl {
    pub fn emit(&self, callback: PlayerCallback) -> bool {
        self.shared.emit(callback)
    }

    pub fn set_auto_play(&self, on: bool) {
        self.shared.auto_play.store(on, Ordering::SeqCst);
    }

    pub fn set_timeline(&self, position_ms: u64, duration_ms: u64) {
        self.shared.position_ms.store(position_ms, Ordering::SeqCst);
        self.shared.duration_ms.store(duration_ms, Ordering::SeqCst);
    }

    pub async fn next_call(&mut self) -> Option<PlayerCall> {
        self.calls.recv().await
    }

    pub async fn wait_for<F>(&mut self, mut pred: F) -> Option<PlayerCall>
    where
        F: FnMut(&PlayerCall) -> bool,
    {
        while let Some(call) = self.calls.recv().await {
            if pred(&call) {
                return Some(call);
            }
        }
        None
    }

    pub fn drain_calls(&mut self) -> Vec<PlayerCall> {
        let mut calls = Vec::new();
        while let Ok(call) = self.calls.try_recv() {
            calls.push(call);
        }
        calls
    }
}

/// Secondary destinations that accept frames in memory
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    failing: Arc<HashSet<String>>,
    send_delay: Duration,
    delivered: Arc<Mutex<HashMap<String, u64>>>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connections to these URIs
    pub fn failing<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing = Arc::new(uris.into_iter().map(Into::into).collect());
        self
    }

    /// Simulate a slow link
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Frames delivered to `uri` so far
    pub fn delivered(&self, uri: &str) -> u64 {
        lock(&self.delivered).get(uri).copied().unwrap_or(0)
    }
}

impl DestinationConnector for LoopbackConnector {
    fn connect(&self, uri: &str) -> BoxFuture<'static, Result<Box<dyn DestinationSink>, FanoutError>> {
        let uri = uri.to_string();
        let refused = self.failing.contains(&uri);
        let send_delay = self.send_delay;
        let delivered = self.delivered.clone();

        Box::pin(async move {
            if refused {
                return Err(FanoutError::Connect {
                    uri,
                    reason: "connection refused".to_string(),
                });
            }
            Ok(Box::new(LoopbackSink {
                uri,
                send_delay,
                delivered,
            }) as Box<dyn DestinationSink>)
        })
    }
}

struct LoopbackSink {
    uri: String,
    send_delay: Duration,
    delivered: Arc<Mutex<HashMap<String, u64>>>,
}

impl DestinationSink for LoopbackSink {
    fn send<'a>(&'a mut self, _frame: &'a EncodedFrame) -> BoxFuture<'a, Result<(), FanoutError>> {
        Box::pin(async move {
            if !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
            *lock(&self.delivered).entry(self.uri.clone()).or_insert(0) += 1;
            Ok(())
        })
    }

    fn close(&mut self) {
        debug!("loopback sink {} closed", self.uri);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_connect_emits_success() {
        let (engine, mut control) = LoopbackPublisher::new();
        let mut engine = engine.with_auto_connect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.bind(tx);

        engine.connect("rtmp://localhost/live/key");
        assert_eq!(
            control.next_call().await,
            Some(PublisherCall::Connect("rtmp://localhost/live/key".to_string()))
        );
        assert!(matches!(
            rx.recv().await,
            Some(PublisherCallback::ConnectionStarted { .. })
        ));
        assert_eq!(rx.recv().await, Some(PublisherCallback::ConnectionSuccess));
    }

    #[test]
    fn test_emit_before_bind_is_dropped() {
        let (_engine, control) = LoopbackPublisher::new();
        assert!(!control.emit(PublisherCallback::Disconnected));
    }

    #[tokio::test]
    async fn test_connector_refuses_failing_uri() {
        let connector = LoopbackConnector::new().failing(["rtmp://bad/live"]);
        assert!(connector.connect("rtmp://bad/live").await.is_err());

        let mut sink = connector.connect("rtmp://good/live").await.unwrap();
        let frame = EncodedFrame {
            kind: FrameKind::Audio,
            pts_us: 0,
            key_frame: false,
            data: Arc::from(vec![1u8, 2, 3]),
        };
        sink.send(&frame).await.unwrap();
        assert_eq!(connector.delivered("rtmp://good/live"), 1);
    }
}
