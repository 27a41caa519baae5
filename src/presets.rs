//! Video/audio quality presets for the publisher encoder
//!
//! Presets are expressed portrait-first (the way a phone is held); the
//! encoder is prepared in landscape-normalized form.

use serde::{Deserialize, Serialize};

use crate::engine::{AudioParams, EncoderProfile, VideoParams};

/// Video quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoQuality {
    /// 240x426, 400 kbps
    #[serde(rename = "240p")]
    Low240p,
    /// 360x640, 800 kbps
    #[serde(rename = "360p")]
    Low360p,
    /// 480x854, 1.2 Mbps
    #[serde(rename = "480p")]
    Sd480p,
    /// 720x1280, 2 Mbps
    #[default]
    #[serde(rename = "720p")]
    Hd720p,
    /// 1080x1920, 4 Mbps
    #[serde(rename = "1080p")]
    Fhd1080p,
}

/// Audio quality preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    /// 64 kbps, 44.1 kHz
    Low,
    /// 128 kbps, 44.1 kHz
    #[default]
    Standard,
    /// 192 kbps, 48 kHz
    High,
}

/// Concrete encoder settings for a preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityConfig {
    pub video_width: u32,
    pub video_height: u32,
    /// Video bitrate in bps
    pub video_bitrate: u32,
    pub video_fps: u32,
    /// Audio bitrate in bps
    pub audio_bitrate: u32,
    pub audio_sample_rate: u32,
}

impl VideoQuality {
    pub const ALL: [VideoQuality; 5] = [
        VideoQuality::Low240p,
        VideoQuality::Low360p,
        VideoQuality::Sd480p,
        VideoQuality::Hd720p,
        VideoQuality::Fhd1080p,
    ];

    pub fn config(self) -> QualityConfig {
        match self {
            VideoQuality::Low240p => QualityConfig {
                video_width: 240,
                video_height: 426,
                video_bitrate: 400_000,
                video_fps: 24,
                audio_bitrate: 64_000,
                audio_sample_rate: 44_100,
            },
            VideoQuality::Low360p => QualityConfig {
                video_width: 360,
                video_height: 640,
                video_bitrate: 800_000,
                video_fps: 24,
                audio_bitrate: 96_000,
                audio_sample_rate: 44_100,
            },
            VideoQuality::Sd480p => QualityConfig {
                video_width: 480,
                video_height: 854,
                video_bitrate: 1_200_000,
                video_fps: 30,
                audio_bitrate: 128_000,
                audio_sample_rate: 44_100,
            },
            VideoQuality::Hd720p => QualityConfig {
                video_width: 720,
                video_height: 1280,
                video_bitrate: 2_000_000,
                video_fps: 30,
                audio_bitrate: 128_000,
                audio_sample_rate: 44_100,
            },
            VideoQuality::Fhd1080p => QualityConfig {
                video_width: 1080,
                video_height: 1920,
                video_bitrate: 4_000_000,
                video_fps: 30,
                audio_bitrate: 192_000,
                audio_sample_rate: 48_000,
            },
        }
    }
}

impl AudioQuality {
    /// (bitrate bps, sample rate Hz)
    pub fn params(self) -> (u32, u32) {
        match self {
            AudioQuality::Low => (64_000, 44_100),
            AudioQuality::Standard => (128_000, 44_100),
            AudioQuality::High => (192_000, 48_000),
        }
    }
}

impl QualityConfig {
    /// Override the audio half of the preset
    pub fn with_audio(mut self, audio: AudioQuality) -> Self {
        let (bitrate, sample_rate) = audio.params();
        self.audio_bitrate = bitrate;
        self.audio_sample_rate = sample_rate;
        self
    }

    /// Encoder parameters: landscape `max(w,h) x min(w,h)`, even dimensions
    pub fn encoder_profile(&self, rotation: u16) -> EncoderProfile {
        let long = self.video_width.max(self.video_height);
        let short = self.video_width.min(self.video_height);
        EncoderProfile {
            video: VideoParams {
                width: make_even(long),
                height: make_even(short),
                fps: self.video_fps,
                bitrate: self.video_bitrate,
                rotation,
            },
            audio: AudioParams {
                bitrate: self.audio_bitrate,
                sample_rate: self.audio_sample_rate,
            },
        }
    }
}

/// Most video encoders require even dimensions
fn make_even(v: u32) -> u32 {
    if v % 2 == 0 {
        v
    } else {
        v + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_profile_is_landscape() {
        let profile = VideoQuality::Hd720p.config().encoder_profile(90);
        assert_eq!(profile.video.width, 1280);
        assert_eq!(profile.video.height, 720);
        assert_eq!(profile.video.rotation, 90);
        assert_eq!(profile.video.bitrate, 2_000_000);
        assert_eq!(profile.audio.sample_rate, 44_100);
    }

    #[test]
    fn test_odd_dimensions_are_made_even() {
        // 240x426 and 480x854 are already even; force an odd one
        let config = QualityConfig {
            video_width: 241,
            video_height: 427,
            ..VideoQuality::Low240p.config()
        };
        let profile = config.encoder_profile(0);
        assert_eq!((profile.video.width, profile.video.height), (428, 242));
    }

    #[test]
    fn test_audio_override() {
        let config = VideoQuality::Hd720p.config().with_audio(AudioQuality::High);
        assert_eq!(config.audio_bitrate, 192_000);
        assert_eq!(config.audio_sample_rate, 48_000);
    }

    #[test]
    fn test_preset_names_round_trip_through_toml() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            quality: VideoQuality,
        }
        let holder: Holder = toml::from_str("quality = \"1080p\"").unwrap();
        assert_eq!(holder.quality, VideoQuality::Fhd1080p);
        assert!(VideoQuality::ALL.iter().all(|q| q.config().video_bitrate > 0));
    }
}
