//! Configuration management for the livecast agent

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::engine::{EncoderProfile, PlayerOptions};
use crate::presets::{AudioQuality, QualityConfig, VideoQuality};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broadcast session settings
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Playback session settings
    #[serde(default)]
    pub player: PlayerConfig,

    /// Foreground/background and camera switch timing
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Secondary destination settings
    #[serde(default)]
    pub fanout: FanoutConfig,

    /// Log level, directory and retention
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-session event channel capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Ingest base URL, e.g. rtmp://host/live
    #[serde(default)]
    pub url: String,

    /// Stream key appended to the base URL
    #[serde(default)]
    pub stream_key: String,

    #[serde(default)]
    pub quality: VideoQuality,

    /// Overrides the audio half of the video preset
    #[serde(default)]
    pub audio: Option<AudioQuality>,

    #[serde(default = "default_true")]
    pub front_camera: bool,

    /// Reconnect schedule after a transient failure
    #[serde(default = "default_publisher_reconnect")]
    pub reconnect: BackoffPolicy,

    /// Where local recordings are written
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Playback base URL
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub stream_name: String,

    /// Repeated play requests within this window are ignored (ms)
    #[serde(default = "default_play_debounce")]
    pub play_debounce_ms: u64,

    /// Retry schedule while connecting
    #[serde(default)]
    pub connect_retry: BackoffPolicy,

    /// Retry schedule after the stream dropped mid-playback
    #[serde(default = "BackoffPolicy::playback_drop")]
    pub drop_retry: BackoffPolicy,

    #[serde(default)]
    pub options: PlayerOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Delay before restarting a stream after returning to the foreground (ms)
    #[serde(default = "default_resume_settle")]
    pub resume_settle_ms: u64,

    /// How long a camera switch blocks further switches (ms)
    #[serde(default = "default_switch_settle")]
    pub switch_settle_ms: u64,

    /// Key-frame requests after a live camera switch (ms after the switch)
    #[serde(default = "default_key_frame_checkpoints")]
    pub key_frame_checkpoints_ms: Vec<u64>,

    /// Delay before reconnecting after a bounced camera switch (ms)
    #[serde(default = "default_bounce_settle")]
    pub bounce_settle_ms: u64,

    /// Force (true) or forbid (false) bouncing on camera switch; unset defers to the engine
    #[serde(default)]
    pub force_bounce: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Delay after the primary goes live before secondaries connect (ms)
    #[serde(default = "default_fanout_settle")]
    pub settle_ms: u64,

    /// Frames buffered per secondary before dropping
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives used when RUST_LOG is unset, e.g. "info,livecast=debug"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log directory; the platform log location when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Rolled log files older than this are deleted at startup (0 keeps everything)
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    64
}

fn default_publisher_reconnect() -> BackoffPolicy {
    BackoffPolicy::default().with_max_retries(3)
}

fn default_recordings_dir() -> PathBuf {
    std::env::temp_dir().join("livecast-recordings")
}

fn default_play_debounce() -> u64 {
    800
}

fn default_resume_settle() -> u64 {
    300
}

fn default_switch_settle() -> u64 {
    1500
}

fn default_key_frame_checkpoints() -> Vec<u64> {
    vec![200, 1000]
}

fn default_bounce_settle() -> u64 {
    500
}

fn default_fanout_settle() -> u64 {
    2000
}

fn default_queue_depth() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_retention_days() -> u64 {
    7
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            stream_key: String::new(),
            quality: VideoQuality::default(),
            audio: None,
            front_camera: true,
            reconnect: default_publisher_reconnect(),
            recordings_dir: default_recordings_dir(),
        }
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            stream_name: String::new(),
            play_debounce_ms: default_play_debounce(),
            connect_retry: BackoffPolicy::default(),
            drop_retry: BackoffPolicy::playback_drop(),
            options: PlayerOptions::default(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            resume_settle_ms: default_resume_settle(),
            switch_settle_ms: default_switch_settle(),
            key_frame_checkpoints_ms: default_key_frame_checkpoints(),
            bounce_settle_ms: default_bounce_settle(),
            force_bounce: None,
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_fanout_settle(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            retention_days: default_log_retention_days(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            publisher: PublisherConfig::default(),
            player: PlayerConfig::default(),
            lifecycle: LifecycleConfig::default(),
            fanout: FanoutConfig::default(),
            logging: LoggingConfig::default(),
            event_capacity: default_event_capacity(),
            config_path: None,
        }
    }
}

impl PublisherConfig {
    pub fn quality_config(&self) -> QualityConfig {
        let config = self.quality.config();
        match self.audio {
            Some(audio) => config.with_audio(audio),
            None => config,
        }
    }

    pub fn encoder_profile(&self) -> EncoderProfile {
        self.quality_config().encoder_profile(0)
    }
}

impl PlayerConfig {
    pub fn play_debounce(&self) -> Duration {
        Duration::from_millis(self.play_debounce_ms)
    }
}

impl LifecycleConfig {
    pub fn resume_settle(&self) -> Duration {
        Duration::from_millis(self.resume_settle_ms)
    }

    pub fn switch_settle(&self) -> Duration {
        Duration::from_millis(self.switch_settle_ms)
    }

    pub fn bounce_settle(&self) -> Duration {
        Duration::from_millis(self.bounce_settle_ms)
    }

    pub fn key_frame_checkpoints(&self) -> Vec<Duration> {
        self.key_frame_checkpoints_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

impl FanoutConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl LoggingConfig {
    pub fn retention(&self) -> Option<Duration> {
        match self.retention_days {
            0 => None,
            days => Some(Duration::from_secs(60 * 60 * 24 * days)),
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from `path`, writing defaults there if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?;

            config.config_path = Some(path.to_path_buf());
            Ok(config)
        } else {
            let config = Config {
                config_path: Some(path.to_path_buf()),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "livecast", "agent")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.publisher.reconnect.max_retries, 3);
        assert_eq!(config.player.connect_retry.max_retries, 5);
        assert_eq!(config.lifecycle.resume_settle_ms, 300);
        assert_eq!(config.config_path().unwrap(), path);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::load_from(&path).unwrap();
        config.publisher.url = "rtmp://ingest.example.com/live".to_string();
        config.publisher.stream_key = "abc123".to_string();
        config.publisher.quality = VideoQuality::Fhd1080p;
        config.lifecycle.force_bounce = Some(true);
        config.save().unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.publisher.url, "rtmp://ingest.example.com/live");
        assert_eq!(reloaded.publisher.quality, VideoQuality::Fhd1080p);
        assert_eq!(reloaded.lifecycle.force_bounce, Some(true));
        assert_eq!(reloaded.fanout.queue_depth, 64);
        assert_eq!(reloaded.logging.level, "info");
        assert_eq!(reloaded.logging.retention_days, 7);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [publisher]
            url = "rtmp://a/live"
            quality = "480p"
            audio = "high"

            [lifecycle]
            key_frame_checkpoints_ms = [100]

            [logging]
            retention_days = 0
            "#,
        )
        .unwrap();

        assert!(config.publisher.front_camera);
        assert_eq!(config.player.play_debounce(), Duration::from_millis(800));
        assert_eq!(config.player.drop_retry, BackoffPolicy::playback_drop());
        assert_eq!(
            config.lifecycle.key_frame_checkpoints(),
            vec![Duration::from_millis(100)]
        );
        let quality = config.publisher.quality_config();
        assert_eq!(quality.video_bitrate, 1_200_000);
        assert_eq!(quality.audio_sample_rate, 48_000);
        assert_eq!(config.publisher.encoder_profile().video.width, 854);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.retention(), None);
    }
}
