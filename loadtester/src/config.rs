//! Load test configuration
//!
//! [`LoadTestParams`] describes one run and is usually built from command line
//! flags. [`RuntimeConfig`] holds process-level settings loaded from
//! environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::media::{Codec, VideoQuality};

/// Sentinel for a coupled-mode parameter that was not supplied
pub const UNSET: i64 = -1;

/// Longest accepted run duration and speaker interval
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Largest frame dimension an IVF header can carry
pub const MAX_DIMENSION: u32 = u16::MAX as u32;

/// Highest accepted coupled-mode bitrate, 100 Mbps
pub const MAX_BITRATE_KBPS: u32 = 100_000;

/// Invalid or incomplete configuration, detected before any room is created
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Unknown layout: {0}")]
    UnknownLayout(String),

    #[error("Coupled mode requires {0}")]
    MissingCoupledParameter(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Unknown video quality: {0}")]
    UnknownQuality(String),

    #[error("Unknown video codec: {0}")]
    UnknownCodec(String),
}

/// Parameters for a single load test run
#[derive(Debug, Clone)]
pub struct LoadTestParams {
    /// Room name, or prefix when more than one room is used
    pub room: String,
    pub room_count: usize,
    /// Hard deadline for the run; zero runs until cancelled
    pub duration: Duration,
    pub publishers: PublisherMode,
    pub subscribers: usize,
    /// Identity prefix; a random one is generated when unset
    pub identity_prefix: Option<String>,
    /// Layout name (`speaker`, `3x3`, `4x4`, `5x5`)
    pub layout: String,

    pub media: MediaParams,
    pub ramp: RampParams,
    pub speakers: SpeakerParams,
}

/// How publisher roles are assigned
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherMode {
    /// Explicit video and audio publisher counts
    Independent { video: usize, audio: usize },
    /// Fixed 3 video / 2 audio split derived from the coupled parameters
    Coupled(CoupledInput),
}

/// Media settings for publishers
#[derive(Debug, Clone)]
pub struct MediaParams {
    /// Highest simulcast tier published
    pub video_resolution: VideoQuality,
    /// Fixed codec; publishers alternate VP8/VP9 when unset
    pub video_codec: Option<Codec>,
    pub simulcast: bool,
    pub audio_bitrate_kbps: u32,
    /// Directory holding recorded IVF clips
    pub clip_dir: Option<PathBuf>,
}

/// Tester creation rate
#[derive(Debug, Clone)]
pub struct RampParams {
    /// Testers started per second; zero or negative starts all at once
    pub num_per_second: f64,
}

/// Speaker simulation settings
#[derive(Debug, Clone)]
pub struct SpeakerParams {
    pub enabled: bool,
    /// Overrides the layout's rotation interval
    pub interval: Option<Duration>,
    /// Random spread applied to each interval, as a fraction of it
    pub jitter: f64,
}

/// Raw coupled-mode parameters, each [`UNSET`] until supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoupledInput {
    pub web_width: i64,
    pub web_height: i64,
    pub web_bitrate_kbps: i64,
    pub screen_width: i64,
    pub screen_height: i64,
    pub screen_bitrate_kbps: i64,
    pub audio_bitrate_kbps: i64,
}

/// Dimensions and bitrate of one coupled video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoDims {
    pub width: u32,
    pub height: u32,
    pub kbps: u32,
}

/// Fully specified coupled-mode parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoupledParams {
    pub web: VideoDims,
    pub screen: VideoDims,
    pub audio_bitrate_kbps: u32,
}

/// Process-level settings
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Prometheus exporter listen address
    pub metrics_addr: Option<SocketAddr>,
    /// How long to wait for testers to report after the run ends
    pub shutdown_grace: Duration,
    /// Simulated connect latency for the loopback router
    pub connect_latency: Duration,
    /// Simulated connect failure probability for the loopback router
    pub failure_rate: f64,
}

impl Default for LoadTestParams {
    fn default() -> Self {
        Self {
            room: "load-test".to_string(),
            room_count: 1,
            duration: Duration::ZERO,
            publishers: PublisherMode::Independent { video: 0, audio: 0 },
            subscribers: 0,
            identity_prefix: None,
            layout: "speaker".to_string(),
            media: MediaParams::default(),
            ramp: RampParams::default(),
            speakers: SpeakerParams::default(),
        }
    }
}

impl Default for MediaParams {
    fn default() -> Self {
        Self {
            video_resolution: VideoQuality::High,
            video_codec: None,
            simulcast: true,
            audio_bitrate_kbps: 32,
            clip_dir: None,
        }
    }
}

impl Default for RampParams {
    fn default() -> Self {
        Self { num_per_second: 5.0 }
    }
}

impl Default for SpeakerParams {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: None,
            jitter: 0.25,
        }
    }
}

impl Default for CoupledInput {
    fn default() -> Self {
        Self {
            web_width: UNSET,
            web_height: UNSET,
            web_bitrate_kbps: UNSET,
            screen_width: UNSET,
            screen_height: UNSET,
            screen_bitrate_kbps: UNSET,
            audio_bitrate_kbps: UNSET,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            metrics_addr: None,
            shutdown_grace: Duration::from_secs(5),
            connect_latency: Duration::ZERO,
            failure_rate: 0.0,
        }
    }
}

impl LoadTestParams {
    /// Independent publisher counts
    pub fn with_publishers(mut self, video: usize, audio: usize) -> Self {
        self.publishers = PublisherMode::Independent { video, audio };
        self
    }

    /// Check the fields that do not depend on layout or coupled resolution
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "room",
                reason: "must not be empty".to_string(),
            });
        }
        if self.room_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "room_count",
                reason: "at least one room is required".to_string(),
            });
        }
        if self.ramp.num_per_second.is_nan() {
            return Err(ConfigError::InvalidValue {
                field: "num_per_second",
                reason: "must be a number".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.speakers.jitter) {
            return Err(ConfigError::InvalidValue {
                field: "speaker_jitter",
                reason: format!("{} is outside [0, 1]", self.speakers.jitter),
            });
        }
        if self.duration > MAX_DURATION {
            return Err(ConfigError::InvalidValue {
                field: "duration",
                reason: format!("{:?} is longer than {:?}", self.duration, MAX_DURATION),
            });
        }
        if let Some(interval) = self.speakers.interval {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "speaker_interval",
                    reason: "must be positive".to_string(),
                });
            }
            if interval > MAX_DURATION {
                return Err(ConfigError::InvalidValue {
                    field: "speaker_interval",
                    reason: format!("{:?} is longer than {:?}", interval, MAX_DURATION),
                });
            }
        }
        Ok(())
    }
}

impl CoupledInput {
    /// True when at least one parameter was supplied
    pub fn any_set(&self) -> bool {
        *self != Self::default()
    }

    /// Turn the raw values into [`CoupledParams`], failing on anything left unset
    pub fn resolve(&self) -> Result<CoupledParams, ConfigError> {
        let web = VideoDims {
            width: required(self.web_width, "web width", MAX_DIMENSION)?,
            height: required(self.web_height, "web height", MAX_DIMENSION)?,
            kbps: required(self.web_bitrate_kbps, "web bitrate", MAX_BITRATE_KBPS)?,
        };
        let screen = VideoDims {
            width: optional(self.screen_width, "screen width", 1280, MAX_DIMENSION)?,
            height: optional(self.screen_height, "screen height", 720, MAX_DIMENSION)?,
            kbps: required(self.screen_bitrate_kbps, "screen bitrate", MAX_BITRATE_KBPS)?,
        };
        let audio_bitrate_kbps =
            optional(self.audio_bitrate_kbps, "audio bitrate", 16, MAX_BITRATE_KBPS)?;

        Ok(CoupledParams {
            web,
            screen,
            audio_bitrate_kbps,
        })
    }
}

fn required(value: i64, name: &'static str, max: u32) -> Result<u32, ConfigError> {
    if value == UNSET {
        return Err(ConfigError::MissingCoupledParameter(name));
    }
    bounded(value, name, max)
}

fn optional(value: i64, name: &'static str, default: u32, max: u32) -> Result<u32, ConfigError> {
    if value == UNSET {
        return Ok(default);
    }
    bounded(value, name, max)
}

fn bounded(value: i64, name: &'static str, max: u32) -> Result<u32, ConfigError> {
    match u32::try_from(value) {
        Ok(v) if v > 0 && v <= max => Ok(v),
        _ => Err(ConfigError::InvalidValue {
            field: name,
            reason: format!("{value} is outside 1..={max}"),
        }),
    }
}

pub fn parse_quality(value: &str) -> Result<VideoQuality, ConfigError> {
    value.parse().map_err(ConfigError::UnknownQuality)
}

pub fn parse_codec(value: &str) -> Result<Codec, ConfigError> {
    value.parse().map_err(ConfigError::UnknownCodec)
}

impl RuntimeConfig {
    /// Load runtime settings from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = env::var("LOADTEST_METRICS_ADDR")
            && let Ok(a) = addr.parse()
        {
            config.metrics_addr = Some(a);
        }
        if let Ok(val) = env::var("LOADTEST_SHUTDOWN_GRACE_SECS")
            && let Ok(secs) = val.parse::<u64>()
        {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Ok(val) = env::var("LOADTEST_CONNECT_LATENCY_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            config.connect_latency = Duration::from_millis(ms);
        }
        if let Ok(val) = env::var("LOADTEST_FAILURE_RATE")
            && let Ok(rate) = val.parse::<f64>()
            && (0.0..=1.0).contains(&rate)
        {
            config.failure_rate = rate;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coupled(web: (i64, i64, i64), screen_bitrate: i64) -> CoupledInput {
        CoupledInput {
            web_width: web.0,
            web_height: web.1,
            web_bitrate_kbps: web.2,
            screen_bitrate_kbps: screen_bitrate,
            ..CoupledInput::default()
        }
    }

    #[test]
    fn test_default_params() {
        let params = LoadTestParams::default();
        assert_eq!(params.room, "load-test");
        assert_eq!(params.room_count, 1);
        assert_eq!(params.layout, "speaker");
        assert_eq!(params.ramp.num_per_second, 5.0);
        assert!(params.media.simulcast);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_coupled_all_unset() {
        let input = CoupledInput::default();
        assert!(!input.any_set());
        assert_eq!(
            input.resolve(),
            Err(ConfigError::MissingCoupledParameter("web width"))
        );
    }

    #[test]
    fn test_coupled_partially_set() {
        let input = coupled((640, 480, 500), UNSET);
        assert!(input.any_set());
        assert_eq!(
            input.resolve(),
            Err(ConfigError::MissingCoupledParameter("screen bitrate"))
        );
    }

    #[test]
    fn test_coupled_defaults() {
        let params = coupled((640, 480, 500), 800).resolve().unwrap();
        assert_eq!(
            params.web,
            VideoDims {
                width: 640,
                height: 480,
                kbps: 500
            }
        );
        assert_eq!((params.screen.width, params.screen.height), (1280, 720));
        assert_eq!(params.screen.kbps, 800);
        assert_eq!(params.audio_bitrate_kbps, 16);
    }

    #[test]
    fn test_coupled_rejects_nonsense() {
        assert!(matches!(
            coupled((0, 480, 500), 800).resolve(),
            Err(ConfigError::InvalidValue { field: "web width", .. })
        ));
        assert!(matches!(
            coupled((640, -7, 500), 800).resolve(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_coupled_ceilings() {
        assert_eq!(
            coupled((640, 480, 5_000_000), 800).resolve(),
            Err(ConfigError::InvalidValue {
                field: "web bitrate",
                reason: "5000000 is outside 1..=100000".to_string(),
            })
        );
        assert!(matches!(
            coupled((640, 480, 500), i64::from(u32::MAX)).resolve(),
            Err(ConfigError::InvalidValue { field: "screen bitrate", .. })
        ));
        assert!(matches!(
            coupled((70_000, 480, 500), 800).resolve(),
            Err(ConfigError::InvalidValue { field: "web width", .. })
        ));

        let tall = CoupledInput {
            screen_height: 65_536,
            ..coupled((640, 480, 500), 800)
        };
        assert!(matches!(
            tall.resolve(),
            Err(ConfigError::InvalidValue { field: "screen height", .. })
        ));

        // The ceilings themselves are accepted
        let params = CoupledInput {
            screen_width: 65_535,
            ..coupled((640, 480, 100_000), 100_000)
        }
        .resolve()
        .unwrap();
        assert_eq!(params.screen.width, 65_535);
        assert_eq!(params.web.kbps, MAX_BITRATE_KBPS);
    }

    #[test]
    fn test_validate_caps_durations() {
        let mut params = LoadTestParams {
            duration: Duration::from_secs(u64::MAX),
            ..LoadTestParams::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::InvalidValue { field: "duration", .. })
        ));

        params.duration = MAX_DURATION;
        assert!(params.validate().is_ok());

        params.speakers.interval = Some(Duration::MAX);
        assert!(matches!(
            params.validate(),
            Err(ConfigError::InvalidValue { field: "speaker_interval", .. })
        ));
    }

    #[test]
    fn test_validate() {
        let mut params = LoadTestParams {
            room_count: 0,
            ..LoadTestParams::default()
        };
        assert!(params.validate().is_err());

        params.room_count = 2;
        params.ramp.num_per_second = f64::NAN;
        assert!(params.validate().is_err());

        params.ramp.num_per_second = -1.0;
        assert!(params.validate().is_ok());

        params.speakers.jitter = 1.5;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_quality("medium"), Ok(VideoQuality::Medium));
        assert_eq!(
            parse_quality("4k"),
            Err(ConfigError::UnknownQuality("4k".to_string()))
        );
        assert_eq!(parse_codec("VP9"), Ok(Codec::Vp9));
        assert!(matches!(parse_codec("h264"), Err(ConfigError::UnknownCodec(_))));
    }

    #[test]
    fn test_runtime_config_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.metrics_addr.is_none());
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.failure_rate, 0.0);
    }
}
