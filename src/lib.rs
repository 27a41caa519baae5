//! livecast
//!
//! Session lifecycle engine for live-stream publishing and playback:
//! connection state machine, bounded reconnect backoff, foreground and
//! background coordination, camera switch coordination and
//! multi-destination fan-out. Media engines plug in through the traits in
//! [`engine`].

pub mod backoff;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod fanout;
pub mod logging;
pub mod presets;
pub mod session;
pub mod stats;
pub mod timer;

pub use backoff::BackoffPolicy;
pub use config::Config;
pub use device::{BouncePolicy, Facing};
pub use error::{DeviceError, FailureClass, FanoutError, SessionError, SwitchError};
pub use events::{SessionEvent, StreamState};
pub use session::{
    InstanceId, PlayerHandle, PublisherHandle, SessionRegistry, SessionSnapshot, SessionState,
};
