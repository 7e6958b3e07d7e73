//! Video tiers, codecs and track layer descriptions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Simulcast quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoQuality {
    Low,
    Medium,
    High,
}

impl VideoQuality {
    pub const ALL: [VideoQuality; 3] = [VideoQuality::Low, VideoQuality::Medium, VideoQuality::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoQuality::Low => "low",
            VideoQuality::Medium => "medium",
            VideoQuality::High => "high",
        }
    }

    /// This tier and every tier below it, lowest first
    pub fn up_to(self) -> Vec<VideoQuality> {
        Self::ALL.into_iter().filter(|q| *q <= self).collect()
    }
}

impl FromStr for VideoQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(VideoQuality::Low),
            "medium" => Ok(VideoQuality::Medium),
            "high" => Ok(VideoQuality::High),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for VideoQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Video codecs that can be looped from IVF clips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Vp8,
    Vp9,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Vp8 => "vp8",
            Codec::Vp9 => "vp9",
        }
    }

    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            Codec::Vp8 => *b"VP80",
            Codec::Vp9 => *b"VP90",
        }
    }

    /// Codec used by the publisher at `index` when none is configured.
    pub fn alternating(index: usize) -> Self {
        if index % 2 == 0 { Codec::Vp8 } else { Codec::Vp9 }
    }

    pub fn descriptor(&self) -> CodecDescriptor {
        CodecDescriptor::video(format!("video/{}", self.as_str()))
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vp8" => Ok(Codec::Vp8),
            "vp9" => Ok(Codec::Vp9),
            other => Err(other.to_string()),
        }
    }
}

/// RTCP feedback mechanisms a track asks the router for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RtcpFeedback {
    Nack,
    NackPli,
}

/// What the session client needs to negotiate a track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecDescriptor {
    pub mime_type: String,
    pub clock_rate: u32,
    pub feedback: Vec<RtcpFeedback>,
}

impl CodecDescriptor {
    pub fn video(mime_type: String) -> Self {
        Self {
            mime_type,
            clock_rate: 90_000,
            feedback: vec![RtcpFeedback::Nack, RtcpFeedback::NackPli],
        }
    }

    pub fn opus() -> Self {
        Self {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            feedback: Vec::new(),
        }
    }
}

/// Advertised properties of one published video layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoLayer {
    pub quality: VideoQuality,
    pub width: u32,
    pub height: u32,
    pub bitrate_bps: u64,
}

/// Resolution, bitrate and cadence of one synthetic video layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSpec {
    pub width: u32,
    pub height: u32,
    pub kbps: u32,
    pub fps: u32,
    pub quality: VideoQuality,
}

impl VideoSpec {
    pub fn new(width: u32, height: u32, kbps: u32, fps: u32, quality: VideoQuality) -> Self {
        Self {
            width,
            height,
            kbps,
            fps,
            quality,
        }
    }

    /// Default spec for a simulcast tier
    pub fn for_quality(quality: VideoQuality) -> Self {
        match quality {
            VideoQuality::Low => Self::new(320, 180, 150, 15, quality),
            VideoQuality::Medium => Self::new(640, 360, 400, 20, quality),
            VideoQuality::High => Self::new(1280, 720, 2000, 30, quality),
        }
    }

    /// Specs published for `top`, lowest tier first
    pub fn simulcast_ladder(top: VideoQuality, simulcast: bool) -> Vec<Self> {
        if simulcast {
            top.up_to().into_iter().map(Self::for_quality).collect()
        } else {
            vec![Self::for_quality(top)]
        }
    }

    /// Fixed pacing interval between output frames
    pub fn frame_duration(&self) -> Duration {
        frame_duration(self.fps)
    }

    /// Encoded bytes per frame at the target bitrate
    pub fn bytes_per_frame(&self) -> usize {
        (self.kbps as usize * 1000 / 8) / self.fps.max(1) as usize
    }

    pub fn to_layer(&self) -> VideoLayer {
        VideoLayer {
            quality: self.quality,
            width: self.width,
            height: self.height,
            bitrate_bps: u64::from(self.kbps) * 1000,
        }
    }
}

/// `1s / fps`, with a zero rate treated as 1 fps
pub fn frame_duration(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.max(1)
}
