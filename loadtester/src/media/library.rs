//! Clip library
//!
//! Resolves the recorded clip each publisher loops. Clips are read from a
//! directory when one is configured (`<codec>_<quality>.ivf`, `opus.ivf`) and
//! synthesized in memory otherwise. Every clip is loaded once per run and
//! shared by all publishers.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::clip::RecordedClip;
use super::spec::{Codec, VideoQuality, VideoSpec};
use super::synth::{synthetic_audio_clip, synthetic_video_clip};
use super::types::MediaError;

/// Length of synthesized clips
const SYNTH_SECONDS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ClipLibrary {
    video: HashMap<(Codec, VideoQuality), RecordedClip>,
    audio: RecordedClip,
    source_dir: Option<PathBuf>,
}

impl ClipLibrary {
    /// Load every clip the run may need.
    pub fn load(dir: Option<&Path>, audio_bitrate_kbps: u32) -> Result<Self, MediaError> {
        let mut video = HashMap::new();
        for codec in [Codec::Vp8, Codec::Vp9] {
            for quality in VideoQuality::ALL {
                let file_name = format!("{}_{}.ivf", codec.as_str(), quality.as_str());
                let clip = match read_clip(dir, &file_name)? {
                    Some(clip) => clip,
                    None => {
                        let spec = VideoSpec::for_quality(quality);
                        synthetic_video_clip(codec, &spec, spec.fps * SYNTH_SECONDS)
                    }
                };
                video.insert((codec, quality), clip);
            }
        }

        let audio = match read_clip(dir, "opus.ivf")? {
            Some(clip) => clip,
            None => synthetic_audio_clip(audio_bitrate_kbps, 50 * SYNTH_SECONDS),
        };

        if let Some(dir) = dir {
            info!("Loaded clip library from {:?}", dir);
        }

        Ok(Self {
            video,
            audio,
            source_dir: dir.map(Path::to_path_buf),
        })
    }

    /// Synthesized clips only
    pub fn synthetic(audio_bitrate_kbps: u32) -> Self {
        let mut video = HashMap::new();
        for codec in [Codec::Vp8, Codec::Vp9] {
            for quality in VideoQuality::ALL {
                let spec = VideoSpec::for_quality(quality);
                video.insert(
                    (codec, quality),
                    synthetic_video_clip(codec, &spec, spec.fps * SYNTH_SECONDS),
                );
            }
        }
        Self {
            video,
            audio: synthetic_audio_clip(audio_bitrate_kbps, 50 * SYNTH_SECONDS),
            source_dir: None,
        }
    }

    /// Clip for a video layer; non-standard specs get a dedicated synthetic clip
    pub fn video_clip(&self, codec: Codec, spec: &VideoSpec) -> RecordedClip {
        if *spec == VideoSpec::for_quality(spec.quality)
            && let Some(clip) = self.video.get(&(codec, spec.quality))
        {
            return clip.clone();
        }
        synthetic_video_clip(codec, spec, spec.fps.max(1) * SYNTH_SECONDS)
    }

    /// Replace the clip used for a standard tier
    pub fn set_video_clip(&mut self, codec: Codec, quality: VideoQuality, clip: RecordedClip) {
        self.video.insert((codec, quality), clip);
    }

    pub fn audio_clip(&self) -> RecordedClip {
        self.audio.clone()
    }

    pub fn source_dir(&self) -> Option<&Path> {
        self.source_dir.as_deref()
    }
}

fn read_clip(dir: Option<&Path>, file_name: &str) -> Result<Option<RecordedClip>, MediaError> {
    let Some(dir) = dir else {
        return Ok(None);
    };
    let path = dir.join(file_name);
    if !path.exists() {
        debug!("No clip at {:?}, synthesizing", path);
        return Ok(None);
    }
    let clip = RecordedClip::read(File::open(&path)?)?;
    debug!("Read clip {:?} ({} bytes)", path, clip.len());
    Ok(Some(clip))
}
