//! Capture device lifecycle coordination (publisher only)
//!
//! Serializes attach/detach/switch of the camera and bridges OS
//! foreground/background signals. The coordinator is owned by a single
//! publisher session, so only one device operation is ever in flight; a
//! facing switch additionally holds the `switching` flag until its settle
//! delay elapses and concurrent switches are rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::engine::{EncoderProfile, PublisherEngine};
use crate::error::{DeviceError, SwitchError};

/// Filters understood by the engine's render pipeline
pub const AVAILABLE_FILTERS: &[&str] = &[
    "none",
    "sepia",
    "grayscale",
    "negative",
    "brightness",
    "contrast",
    "saturation",
    "edge_detection",
    "beauty",
    "cartoon",
    "glitch",
    "snow",
    "blur",
];

/// Map a requested filter to a known one; unknown names disable filtering
pub fn normalize_filter(name: &str) -> &'static str {
    let lower = name.trim().to_ascii_lowercase();
    let lower = if lower == "greyscale" { "grayscale".to_string() } else { lower };
    AVAILABLE_FILTERS
        .iter()
        .copied()
        .find(|known| *known == lower)
        .unwrap_or("none")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    #[default]
    Front,
    Back,
}

impl Facing {
    pub fn opposite(self) -> Self {
        match self {
            Facing::Front => Facing::Back,
            Facing::Back => Facing::Front,
        }
    }
}

/// Whether a facing switch must stop and restart the encode/connection
/// pipeline instead of hot-switching the camera under a live encoder.
/// Supplied by the platform layer.
#[derive(Clone, Default)]
pub enum BouncePolicy {
    #[default]
    HotSwitch,
    Bounce,
    Custom(Arc<dyn Fn(Facing, Facing) -> bool + Send + Sync>),
}

impl BouncePolicy {
    pub fn requires_bounce(&self, from: Facing, to: Facing) -> bool {
        match self {
            BouncePolicy::HotSwitch => false,
            BouncePolicy::Bounce => true,
            BouncePolicy::Custom(predicate) => predicate(from, to),
        }
    }
}

impl fmt::Debug for BouncePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BouncePolicy::HotSwitch => f.write_str("HotSwitch"),
            BouncePolicy::Bounce => f.write_str("Bounce"),
            BouncePolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Camera/microphone attachment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DeviceState {
    pub attached: bool,
    pub facing: Facing,
    pub switching: bool,
    pub torch: bool,
    pub muted: bool,
    pub backgrounded: bool,
}

/// Result of a successful attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attached {
    pub facing: Facing,
    /// Already attached to this facing; nothing was done
    pub unchanged: bool,
}

/// What the session must do around a facing switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchPlan {
    pub from: Facing,
    pub to: Facing,
    /// Stop and restart the pipeline instead of hot-switching
    pub bounce: bool,
    /// Delays after the switch at which to request key frames (empty when not streaming)
    pub key_frame_checkpoints: Vec<Duration>,
    /// Hold `switching` for this long
    pub settle: Duration,
}

pub struct DeviceCoordinator {
    state: DeviceState,
    profile: EncoderProfile,
    bounce: BouncePolicy,
    key_frame_checkpoints: Vec<Duration>,
    switch_settle: Duration,
}

impl DeviceCoordinator {
    pub fn new(
        facing: Facing,
        profile: EncoderProfile,
        bounce: BouncePolicy,
        lifecycle: &LifecycleConfig,
    ) -> Self {
        let bounce = match lifecycle.force_bounce {
            Some(true) => BouncePolicy::Bounce,
            Some(false) => BouncePolicy::HotSwitch,
            None => bounce,
        };

        Self {
            state: DeviceState {
                facing,
                ..DeviceState::default()
            },
            profile,
            bounce,
            key_frame_checkpoints: lifecycle.key_frame_checkpoints(),
            switch_settle: lifecycle.switch_settle(),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn profile(&self) -> &EncoderProfile {
        &self.profile
    }

    /// Push encoder parameters to the engine. Never assume a previous
    /// preparation survived a background transition.
    pub fn prepare(&self, engine: &mut dyn PublisherEngine) -> Result<(), DeviceError> {
        let video = &self.profile.video;
        if !engine.prepare_video(video) {
            warn!(
                "prepareVideo failed: {}x{} @ {}bps",
                video.width, video.height, video.bitrate
            );
            return Err(DeviceError::PrepareFailed("video"));
        }
        if !engine.prepare_audio(&self.profile.audio) {
            warn!("prepareAudio failed");
            return Err(DeviceError::PrepareFailed("audio"));
        }
        Ok(())
    }

    /// Attach the camera for `facing`; a no-op if already attached to it
    pub fn attach(
        &mut self,
        engine: &mut dyn PublisherEngine,
        facing: Facing,
    ) -> Result<Attached, DeviceError> {
        if self.state.attached && self.state.facing == facing {
            return Ok(Attached {
                facing,
                unchanged: true,
            });
        }

        if self.state.attached {
            engine.stop_capture();
            self.state.attached = false;
        }

        engine.start_capture(facing)?;
        self.state.attached = true;
        self.state.facing = facing;
        debug!("Capture attached ({:?})", facing);

        Ok(Attached {
            facing,
            unchanged: false,
        })
    }

    pub fn detach(&mut self, engine: &mut dyn PublisherEngine) {
        if self.state.attached {
            engine.stop_capture();
            self.state.attached = false;
            if self.state.torch {
                self.state.torch = false;
            }
            debug!("Capture detached");
        }
    }

    /// Reserve a facing switch. Nothing touches the hardware yet; the
    /// session tears down the connection first when the plan bounces.
    pub fn begin_switch(&mut self, streaming: bool) -> Result<SwitchPlan, SwitchError> {
        if self.state.switching {
            return Err(SwitchError::SwitchInProgress);
        }
        if !self.state.attached {
            return Err(DeviceError::NotAttached.into());
        }

        self.state.switching = true;
        let from = self.state.facing;
        let to = from.opposite();
        let bounce = streaming && self.bounce.requires_bounce(from, to);

        Ok(SwitchPlan {
            from,
            to,
            bounce,
            key_frame_checkpoints: if streaming && !bounce {
                self.key_frame_checkpoints.clone()
            } else {
                Vec::new()
            },
            settle: self.switch_settle,
        })
    }

    /// Swap the camera as planned
    pub fn apply_switch(
        &mut self,
        engine: &mut dyn PublisherEngine,
        plan: &SwitchPlan,
    ) -> Result<(), DeviceError> {
        // Torch only exists on the back camera
        if plan.to == Facing::Front && self.state.torch {
            engine.set_torch(false);
            self.state.torch = false;
        }

        engine.stop_capture();
        self.state.attached = false;

        match engine.start_capture(plan.to) {
            Ok(()) => {
                self.state.attached = true;
                self.state.facing = plan.to;
                engine.set_zoom(0.0);
                info!("Camera switched {:?} -> {:?}", plan.from, plan.to);
                Ok(())
            }
            Err(e) => {
                warn!("Switch to {:?} failed: {}; restoring {:?}", plan.to, e, plan.from);
                if engine.start_capture(plan.from).is_ok() {
                    self.state.attached = true;
                }
                Err(e)
            }
        }
    }

    /// Settle delay elapsed
    pub fn finish_switch(&mut self) {
        if self.state.switching {
            debug!("Camera switch settled");
        }
        self.state.switching = false;
    }

    /// OS may revoke capture hardware in the background: always release it
    pub fn on_background(&mut self, engine: &mut dyn PublisherEngine) {
        self.detach(engine);
        self.state.switching = false;
        self.state.backgrounded = true;
    }

    /// Re-prepare the encoder, then re-attach the last facing
    pub fn on_foreground(&mut self, engine: &mut dyn PublisherEngine) -> Result<Attached, DeviceError> {
        self.state.backgrounded = false;
        self.prepare(engine)?;
        let facing = self.state.facing;
        self.attach(engine, facing)
    }

    /// Returns the new torch state; unchanged on the front camera
    pub fn toggle_torch(&mut self, engine: &mut dyn PublisherEngine) -> bool {
        if !self.state.attached || self.state.facing == Facing::Front {
            debug!("Flash not available on this camera");
            return self.state.torch;
        }
        let wanted = !self.state.torch;
        if engine.set_torch(wanted) {
            self.state.torch = wanted;
        }
        self.state.torch
    }

    pub fn toggle_mute(&mut self, engine: &mut dyn PublisherEngine) -> bool {
        self.state.muted = !self.state.muted;
        engine.set_muted(self.state.muted);
        self.state.muted
    }
}
