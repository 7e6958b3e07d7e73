//! Run planning
//!
//! Turns [`LoadTestParams`] into the concrete list of rooms and testers for a
//! run. Everything that can be rejected is rejected here, before any room is
//! created or connection attempted.

use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

use super::layout::LayoutPlan;
use super::tester::{TesterSpec, VideoPublish};
use crate::config::{ConfigError, CoupledParams, LoadTestParams, MediaParams, PublisherMode};
use crate::media::{Codec, VideoQuality, VideoSpec};
use crate::session::TrackSource;

const PREFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const PREFIX_LENGTH: usize = 8;

/// Frame rate of coupled camera streams
const COUPLED_WEB_FPS: u32 = 15;
/// Frame rate of coupled screen-share streams
const COUPLED_SCREEN_FPS: u32 = 5;

/// Random identity prefix for runs that do not configure one
pub fn random_prefix() -> String {
    let mut rng = rand::rng();
    (0..PREFIX_LENGTH)
        .map(|_| PREFIX_CHARSET[rng.random_range(0..PREFIX_CHARSET.len())] as char)
        .collect()
}

/// Speaker rotation settings for a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeakerPlan {
    pub interval: Duration,
    pub jitter: f64,
}

/// Publisher counts per room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherCounts {
    pub video: usize,
    pub audio: usize,
}

/// Fully resolved run
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub scenario: Option<String>,
    pub layout: LayoutPlan,
    pub rooms: Vec<String>,
    pub publishers: PublisherCounts,
    pub subscribers: usize,
    /// Every tester of every room, room-major
    pub testers: Vec<TesterSpec>,
    pub duration: Duration,
    pub ramp_rate: f64,
    pub speakers: Option<SpeakerPlan>,
    pub audio_bitrate_kbps: u32,
    pub clip_dir: Option<PathBuf>,
}

impl RunPlan {
    pub fn build(params: &LoadTestParams) -> Result<Self, ConfigError> {
        params.validate()?;
        let layout = LayoutPlan::resolve(&params.layout)?;

        let (publishers, coupled) = match params.publishers {
            PublisherMode::Independent { video, audio } => (PublisherCounts { video, audio }, None),
            PublisherMode::Coupled(ref input) => {
                let coupled = input.resolve()?;
                (PublisherCounts { video: 3, audio: 2 }, Some(coupled))
            }
        };
        let audio_bitrate_kbps = coupled
            .map(|c| c.audio_bitrate_kbps)
            .unwrap_or(params.media.audio_bitrate_kbps);

        let rooms: Vec<String> = if params.room_count == 1 {
            vec![params.room.clone()]
        } else {
            (0..params.room_count)
                .map(|i| format!("{}_{}", params.room, i))
                .collect()
        };

        let prefix = params
            .identity_prefix
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(random_prefix);

        let per_room = publishers.video.max(publishers.audio) + params.subscribers;
        let mut testers = Vec::with_capacity(per_room * rooms.len());
        for room in &rooms {
            for i in 0..publishers.video.max(publishers.audio) {
                testers.push(TesterSpec {
                    index: testers.len(),
                    room: room.clone(),
                    identity: format!("{prefix}_pub_{i}"),
                    video: (i < publishers.video)
                        .then(|| video_publish(i, &params.media, coupled.as_ref())),
                    audio: i < publishers.audio,
                    subscribe: None,
                });
            }
            for i in 0..params.subscribers {
                testers.push(TesterSpec {
                    index: testers.len(),
                    room: room.clone(),
                    identity: format!("{prefix}_sub_{i}"),
                    video: None,
                    audio: false,
                    subscribe: Some(layout),
                });
            }
        }

        let speakers = params.speakers.enabled.then(|| SpeakerPlan {
            interval: params.speakers.interval.unwrap_or(layout.rotation_interval),
            jitter: params.speakers.jitter,
        });

        Ok(Self {
            scenario: None,
            layout,
            rooms,
            publishers,
            subscribers: params.subscribers,
            testers,
            duration: params.duration,
            ramp_rate: params.ramp.num_per_second,
            speakers,
            audio_bitrate_kbps,
            clip_dir: params.media.clip_dir.clone(),
        })
    }

    pub fn with_scenario(mut self, name: impl Into<String>) -> Self {
        self.scenario = Some(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.testers.is_empty()
    }
}

fn video_publish(index: usize, media: &MediaParams, coupled: Option<&CoupledParams>) -> VideoPublish {
    let codec = media.video_codec.unwrap_or_else(|| Codec::alternating(index));
    match coupled {
        // Two cameras and one screen share, single layer each
        Some(coupled) if index < 2 => VideoPublish {
            codec,
            specs: vec![VideoSpec::new(
                coupled.web.width,
                coupled.web.height,
                coupled.web.kbps,
                COUPLED_WEB_FPS,
                VideoQuality::High,
            )],
            source: TrackSource::Camera,
        },
        Some(coupled) => VideoPublish {
            codec,
            specs: vec![VideoSpec::new(
                coupled.screen.width,
                coupled.screen.height,
                coupled.screen.kbps,
                COUPLED_SCREEN_FPS,
                VideoQuality::High,
            )],
            source: TrackSource::ScreenShare,
        },
        None => VideoPublish {
            codec,
            specs: VideoSpec::simulcast_ladder(media.video_resolution, media.simulcast),
            source: TrackSource::Camera,
        },
    }
}
