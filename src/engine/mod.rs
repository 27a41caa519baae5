//! Media engine seams
//!
//! The codec pipeline, capture hardware and wire protocols live in a
//! platform media engine. Sessions drive it through these traits and receive
//! its asynchronous callbacks on a channel handed over with `bind`, so every
//! callback is marshalled onto the session's owner task.

pub mod loopback;

use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::device::{BouncePolicy, Facing};
use crate::error::{DeviceError, FanoutError};

/// Video encoder parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// bps
    pub bitrate: u32,
    /// Degrees, as reported by the device orientation
    pub rotation: u16,
}

/// Audio encoder parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    /// bps
    pub bitrate: u32,
    pub sample_rate: u32,
}

/// Everything needed to (re)prepare the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderProfile {
    pub video: VideoParams,
    pub audio: AudioParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Video,
    Audio,
}

/// One encoded access unit produced for the primary stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub kind: FrameKind,
    pub pts_us: u64,
    pub key_frame: bool,
    pub data: Arc<[u8]>,
}

/// Asynchronous notifications from a publisher engine
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherCallback {
    ConnectionStarted { uri: String },
    ConnectionSuccess,
    ConnectionFailed { reason: String },
    AuthError,
    Disconnected,
    /// Periodic throughput sample
    Bitrate { bytes_per_second: u64 },
    /// Encoded output, mirrored to secondary destinations
    Frame(EncodedFrame),
}

pub type PublisherCallbacks = mpsc::UnboundedSender<PublisherCallback>;

/// Capture + encode + publish engine
pub trait PublisherEngine: Send {
    /// Hand over the callback channel. Called once before any other method.
    fn bind(&mut self, callbacks: PublisherCallbacks);

    fn prepare_video(&mut self, params: &VideoParams) -> bool;

    fn prepare_audio(&mut self, params: &AudioParams) -> bool;

    fn start_capture(&mut self, facing: Facing) -> Result<(), DeviceError>;

    fn stop_capture(&mut self);

    /// Start publishing; the outcome arrives as a callback
    fn connect(&mut self, uri: &str);

    fn disconnect(&mut self);

    fn request_key_frame(&mut self);

    fn set_muted(&mut self, muted: bool);

    /// Returns false if the current camera has no torch
    fn set_torch(&mut self, on: bool) -> bool;

    /// Normalized 0..1 over the device zoom range
    fn set_zoom(&mut self, level: f32);

    /// Normalized -1..1 over the device exposure compensation range
    fn set_exposure(&mut self, value: f32);

    fn set_filter(&mut self, name: &str);

    fn start_recording(&mut self, path: &Path) -> Result<()>;

    fn stop_recording(&mut self);

    /// Whether a facing switch must bounce the pipeline on this hardware
    fn bounce_policy(&self) -> BouncePolicy {
        BouncePolicy::HotSwitch
    }
}

/// Asynchronous notifications from a player engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerCallback {
    Connecting,
    Buffering,
    Playing,
    Error { msg: String },
    Ended,
}

pub type PlayerCallbacks = mpsc::UnboundedSender<PlayerCallback>;

/// Low-latency playback tuning handed to the player engine on open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerOptions {
    #[serde(default = "default_caching_ms")]
    pub network_caching_ms: u32,

    #[serde(default = "default_caching_ms")]
    pub live_caching_ms: u32,

    #[serde(default = "default_true")]
    pub hardware_decoding: bool,

    #[serde(default = "default_true")]
    pub drop_late_frames: bool,
}

fn default_caching_ms() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            network_caching_ms: default_caching_ms(),
            live_caching_ms: default_caching_ms(),
            hardware_decoding: true,
            drop_late_frames: true,
        }
    }
}

/// Remote stream playback engine
pub trait PlayerEngine: Send {
    fn bind(&mut self, callbacks: PlayerCallbacks);

    fn open(&mut self, uri: &str, options: &PlayerOptions);

    fn stop(&mut self);

    fn pause(&mut self);

    fn seek(&mut self, position_ms: u64);

    fn set_rate(&mut self, rate: f32);

    /// 0..1
    fn set_volume(&mut self, volume: f32);

    fn position_ms(&self) -> u64;

    fn duration_ms(&self) -> u64;
}

/// Opens connections to secondary publish targets
pub trait DestinationConnector: Send + Sync {
    fn connect(&self, uri: &str) -> BoxFuture<'static, Result<Box<dyn DestinationSink>, FanoutError>>;
}

/// An open secondary publish connection
pub trait DestinationSink: Send {
    fn send<'a>(&'a mut self, frame: &'a EncodedFrame) -> BoxFuture<'a, Result<(), FanoutError>>;

    fn close(&mut self);
}
