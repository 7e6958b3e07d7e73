//! Synthetic IVF clips
//!
//! Used when no recorded clip is available on disk. Payloads are filler bytes
//! sized to the target bitrate; the first four bytes carry the frame index so a
//! consumer can tell which frame it received.

use bytes::{BufMut, BytesMut};

use super::clip::{FILE_HEADER_LEN, IVF_SIGNATURE, RecordedClip, Timebase};
use super::spec::{Codec, VideoSpec};

pub const OPUS_FOURCC: [u8; 4] = *b"OPUS";
pub const OPUS_FRAME_MS: u32 = 20;

/// Keyframes are this many times larger than delta frames
const KEYFRAME_SCALE: usize = 4;
const MIN_PAYLOAD: usize = 8;

/// Incremental IVF writer
pub struct ClipWriter {
    buf: BytesMut,
    frames: u32,
}

impl ClipWriter {
    pub fn new(fourcc: [u8; 4], width: u16, height: u16, timebase: Timebase) -> Self {
        let mut buf = BytesMut::with_capacity(FILE_HEADER_LEN);
        buf.put_slice(&IVF_SIGNATURE);
        buf.put_u16_le(0);
        buf.put_u16_le(FILE_HEADER_LEN as u16);
        buf.put_slice(&fourcc);
        buf.put_u16_le(width);
        buf.put_u16_le(height);
        buf.put_u32_le(timebase.denominator);
        buf.put_u32_le(timebase.numerator);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        Self { buf, frames: 0 }
    }

    pub fn push_frame(&mut self, timestamp: u64, payload: &[u8]) -> &mut Self {
        self.buf.put_u32_le(payload.len() as u32);
        self.buf.put_u64_le(timestamp);
        self.buf.put_slice(payload);
        self.frames += 1;
        self
    }

    pub fn finish(mut self) -> RecordedClip {
        self.buf[24..28].copy_from_slice(&self.frames.to_le_bytes());
        RecordedClip::from_bytes(self.buf.freeze())
    }
}

/// Filler payload whose first four bytes are `index` (big-endian)
pub fn filler_payload(index: u32, size: usize) -> Vec<u8> {
    let size = size.max(MIN_PAYLOAD);
    let mut payload = Vec::with_capacity(size);
    payload.extend_from_slice(&index.to_be_bytes());
    let seed = index as u8;
    payload.extend((4..size).map(|i| seed.wrapping_add(i as u8).wrapping_mul(31)));
    payload
}

/// Frame index stamped by [`filler_payload`], if the payload is long enough
pub fn payload_index(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Video clip at the spec's native rate with a keyframe every second.
///
/// Dimensions beyond what the IVF header holds are clamped.
pub fn synthetic_video_clip(codec: Codec, spec: &VideoSpec, frames: u32) -> RecordedClip {
    let fps = spec.fps.max(1);
    let mut writer = ClipWriter::new(
        codec.fourcc(),
        u16::try_from(spec.width).unwrap_or(u16::MAX),
        u16::try_from(spec.height).unwrap_or(u16::MAX),
        Timebase::new(1, fps),
    );
    let delta_size = spec.bytes_per_frame();
    for i in 0..frames {
        let size = if i % fps == 0 {
            delta_size * KEYFRAME_SCALE
        } else {
            delta_size
        };
        writer.push_frame(i as u64, &filler_payload(i, size));
    }
    writer.finish()
}

/// Opus-framed audio clip with 20ms frames
pub fn synthetic_audio_clip(bitrate_kbps: u32, frames: u32) -> RecordedClip {
    let frames_per_second = 1000 / OPUS_FRAME_MS;
    let mut writer = ClipWriter::new(OPUS_FOURCC, 0, 0, Timebase::new(1, frames_per_second));
    let size = (bitrate_kbps as usize * 1000 / 8) / frames_per_second as usize;
    for i in 0..frames {
        writer.push_frame(i as u64, &filler_payload(i, size));
    }
    writer.finish()
}
