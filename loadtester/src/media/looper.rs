//! Looping media source
//!
//! Replays a bounded recorded clip as an unbounded sample sequence. Output
//! pacing comes from the configured frame rate; the clip's own timestamps are
//! only tracked for diagnostics.

use std::time::Duration;
use tracing::{debug, trace};

use super::clip::{ClipCursor, ClipHeader, Frame, RecordedClip};
use super::spec::{Codec, CodecDescriptor, VideoLayer, VideoSpec};
use super::synth::OPUS_FRAME_MS;
use super::types::{ClipFormatError, MediaError, Sample};

/// Per-publisher cursor over a shared [`RecordedClip`]
#[derive(Debug)]
pub struct LoopingMediaSource {
    clip: RecordedClip,
    cursor: Option<ClipCursor>,
    header: Option<ClipHeader>,
    frame_duration: Duration,
    descriptor: CodecDescriptor,
    layer: Option<VideoLayer>,
    last_timestamp: u64,
    source_elapsed: Duration,
    loops: u64,
}

impl LoopingMediaSource {
    pub fn new(clip: RecordedClip, frame_duration: Duration, descriptor: CodecDescriptor) -> Self {
        Self {
            clip,
            cursor: None,
            header: None,
            frame_duration,
            descriptor,
            layer: None,
            last_timestamp: 0,
            source_elapsed: Duration::ZERO,
            loops: 0,
        }
    }

    /// Video source paced at the spec's frame rate
    pub fn video(clip: RecordedClip, spec: &VideoSpec, codec: Codec) -> Self {
        let mut source = Self::new(clip, spec.frame_duration(), codec.descriptor());
        source.layer = Some(spec.to_layer());
        source
    }

    /// Opus source paced at 20ms frames
    pub fn audio(clip: RecordedClip) -> Self {
        Self::new(
            clip,
            Duration::from_millis(OPUS_FRAME_MS as u64),
            CodecDescriptor::opus(),
        )
    }

    /// Parse the clip header if no pass is in progress.
    pub fn open(&mut self) -> Result<ClipHeader, ClipFormatError> {
        if self.cursor.is_some()
            && let Some(header) = self.header
        {
            return Ok(header);
        }

        let (cursor, header) = ClipCursor::open(&self.clip)?;
        if self.header.is_none() {
            debug!(
                fourcc = %String::from_utf8_lossy(&header.fourcc),
                width = header.width,
                height = header.height,
                declared_frames = header.declared_frames,
                "Opened clip"
            );
        }
        self.cursor = Some(cursor);
        self.header = Some(header);
        Ok(header)
    }

    /// Next frame of the clip, wrapping to the first frame at end of stream.
    ///
    /// A pull performs at most one rewind; a clip that yields nothing right
    /// after reopening is reported as empty instead of retried.
    pub fn next_sample(&mut self) -> Result<Sample, MediaError> {
        for _ in 0..2 {
            if self.cursor.is_none() {
                self.open()?;
            }
            let Some(cursor) = self.cursor.as_mut() else {
                continue;
            };

            match cursor.next_frame()? {
                Some(frame) => return Ok(self.emit(frame)),
                None => {
                    self.cursor = None;
                    self.loops += 1;
                    trace!(loops = self.loops, "Clip exhausted, rewinding");
                }
            }
        }

        Err(ClipFormatError::EmptyClip.into())
    }

    fn emit(&mut self, frame: Frame) -> Sample {
        let delta = frame.timestamp.saturating_sub(self.last_timestamp);
        if let Some(header) = self.header {
            self.source_elapsed += header.timebase.ticks_to_duration(delta);
        }
        self.last_timestamp = frame.timestamp;

        Sample {
            data: frame.payload,
            duration: self.frame_duration,
        }
    }

    pub fn codec(&self) -> &CodecDescriptor {
        &self.descriptor
    }

    /// Layer advertised for this source, if it carries video
    pub fn layer(&self) -> Option<VideoLayer> {
        self.layer
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Completed passes over the clip
    pub fn loops(&self) -> u64 {
        self.loops
    }

    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    /// Clip time covered so far according to its own timestamps
    pub fn source_elapsed(&self) -> Duration {
        self.source_elapsed
    }
}
