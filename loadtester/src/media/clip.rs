//! Recorded clip buffer and IVF frame cursor
//!
//! A clip is loaded once and shared read-only between every publisher that
//! loops it. Each publisher walks the buffer with its own [`ClipCursor`].

use bytes::Bytes;
use std::io::Read;
use std::time::Duration;

use super::types::{ClipFormatError, MediaError};

pub const IVF_SIGNATURE: [u8; 4] = *b"DKIF";
pub const FILE_HEADER_LEN: usize = 32;
pub const FRAME_HEADER_LEN: usize = 12;

/// Rational timebase: `numerator / denominator` seconds per tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    pub numerator: u32,
    pub denominator: u32,
}

impl Timebase {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Convert a tick count into wall time.
    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        if self.denominator == 0 {
            return Duration::ZERO;
        }
        let nanos =
            ticks as u128 * self.numerator as u128 * 1_000_000_000 / self.denominator as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

/// Parsed IVF file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipHeader {
    pub fourcc: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub timebase: Timebase,
    /// Frame count as declared by the writer; not trusted for looping
    pub declared_frames: u32,
}

impl ClipHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ClipFormatError> {
        if data.len() < FILE_HEADER_LEN {
            return Err(ClipFormatError::TruncatedHeader {
                len: data.len(),
                needed: FILE_HEADER_LEN,
            });
        }

        let mut signature = [0u8; 4];
        signature.copy_from_slice(&data[0..4]);
        if signature != IVF_SIGNATURE {
            return Err(ClipFormatError::BadSignature(signature));
        }

        let version = read_u16(data, 4);
        if version != 0 {
            return Err(ClipFormatError::UnsupportedVersion(version));
        }

        let mut fourcc = [0u8; 4];
        fourcc.copy_from_slice(&data[8..12]);

        let timebase = Timebase {
            denominator: read_u32(data, 16),
            numerator: read_u32(data, 20),
        };
        if timebase.denominator == 0 {
            return Err(ClipFormatError::ZeroTimebase);
        }

        Ok(Self {
            fourcc,
            width: read_u16(data, 12),
            height: read_u16(data, 14),
            timebase,
            declared_frames: read_u32(data, 24),
        })
    }
}

/// Immutable recorded elementary stream
#[derive(Debug, Clone)]
pub struct RecordedClip {
    data: Bytes,
}

impl RecordedClip {
    /// Read a whole clip into memory.
    pub fn read(mut reader: impl Read) -> Result<Self, MediaError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(Self::from_bytes(data))
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One frame read from a clip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    pub timestamp: u64,
}

/// Read position within one pass over a clip
#[derive(Debug)]
pub struct ClipCursor {
    data: Bytes,
    offset: usize,
}

impl ClipCursor {
    /// Parse the header and position the cursor on the first frame.
    ///
    /// Fails with [`ClipFormatError::EmptyClip`] when no frame follows the header.
    pub fn open(clip: &RecordedClip) -> Result<(Self, ClipHeader), ClipFormatError> {
        let header = ClipHeader::parse(&clip.data)?;
        if clip.data.len() == FILE_HEADER_LEN {
            return Err(ClipFormatError::EmptyClip);
        }

        let cursor = Self {
            data: clip.data.clone(),
            offset: FILE_HEADER_LEN,
        };
        Ok((cursor, header))
    }

    /// Next frame, or `None` once the end of the buffer is reached on a frame boundary.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ClipFormatError> {
        let remaining = self.data.len() - self.offset;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < FRAME_HEADER_LEN {
            return Err(ClipFormatError::TruncatedFrame {
                offset: self.offset,
                expected: FRAME_HEADER_LEN,
                available: remaining,
            });
        }

        let size = read_u32(&self.data, self.offset) as usize;
        let timestamp = read_u64(&self.data, self.offset + 4);
        let start = self.offset + FRAME_HEADER_LEN;
        let available = self.data.len() - start;
        if size > available {
            return Err(ClipFormatError::TruncatedFrame {
                offset: self.offset,
                expected: size,
                available,
            });
        }

        self.offset = start + size;
        Ok(Some(Frame {
            payload: self.data.slice(start..start + size),
            timestamp,
        }))
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::synth::ClipWriter;

    fn two_frame_clip() -> RecordedClip {
        let mut writer = ClipWriter::new(*b"VP80", 320, 180, Timebase::new(1, 30));
        writer.push_frame(0, b"first");
        writer.push_frame(1, b"second");
        writer.finish()
    }

    #[test]
    fn test_header_fields() {
        let clip = two_frame_clip();
        let (_, header) = ClipCursor::open(&clip).unwrap();
        assert_eq!(&header.fourcc, b"VP80");
        assert_eq!(header.width, 320);
        assert_eq!(header.height, 180);
        assert_eq!(header.timebase, Timebase::new(1, 30));
        assert_eq!(header.declared_frames, 2);
    }

    #[test]
    fn test_frames_then_end() {
        let clip = two_frame_clip();
        let (mut cursor, _) = ClipCursor::open(&clip).unwrap();

        let first = cursor.next_frame().unwrap().unwrap();
        assert_eq!(&first.payload[..], b"first");
        assert_eq!(first.timestamp, 0);

        let second = cursor.next_frame().unwrap().unwrap();
        assert_eq!(&second.payload[..], b"second");
        assert_eq!(second.timestamp, 1);

        assert!(cursor.next_frame().unwrap().is_none());
        assert_eq!(cursor.offset(), clip.len());
    }

    #[test]
    fn test_rejects_bad_signature() {
        let mut bytes = two_frame_clip().as_bytes().to_vec();
        bytes[0..4].copy_from_slice(b"RIFF");
        let err = ClipCursor::open(&RecordedClip::from_bytes(bytes)).unwrap_err();
        assert_eq!(err, ClipFormatError::BadSignature(*b"RIFF"));
    }

    #[test]
    fn test_rejects_short_header() {
        let clip = RecordedClip::from_bytes(b"DKIF".to_vec());
        assert!(matches!(
            ClipCursor::open(&clip),
            Err(ClipFormatError::TruncatedHeader { len: 4, .. })
        ));
    }

    #[test]
    fn test_rejects_header_only_clip() {
        let clip = ClipWriter::new(*b"VP80", 320, 180, Timebase::new(1, 30)).finish();
        assert_eq!(clip.len(), FILE_HEADER_LEN);
        assert_eq!(
            ClipCursor::open(&clip).unwrap_err(),
            ClipFormatError::EmptyClip
        );
    }

    #[test]
    fn test_rejects_zero_timebase() {
        let clip = ClipWriter::new(*b"VP80", 320, 180, Timebase::new(1, 0)).finish();
        assert_eq!(
            ClipCursor::open(&clip).unwrap_err(),
            ClipFormatError::ZeroTimebase
        );
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let mut bytes = two_frame_clip().as_bytes().to_vec();
        bytes.truncate(bytes.len() - 3);
        let clip = RecordedClip::from_bytes(bytes);
        let (mut cursor, _) = ClipCursor::open(&clip).unwrap();

        assert!(cursor.next_frame().unwrap().is_some());
        assert!(matches!(
            cursor.next_frame(),
            Err(ClipFormatError::TruncatedFrame { expected: 6, available: 3, .. })
        ));
    }

    #[test]
    fn test_read_error_is_io() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk gone"))
            }
        }

        let err = RecordedClip::read(Broken).unwrap_err();
        assert!(matches!(err, MediaError::Io(_)));
        assert_eq!(err.to_string(), "IO error: disk gone");
    }

    #[test]
    fn test_timebase_conversion() {
        let tb = Timebase::new(1, 90_000);
        assert_eq!(tb.ticks_to_duration(90_000), Duration::from_secs(1));
        assert_eq!(tb.ticks_to_duration(3_000), Duration::from_nanos(33_333_333));
    }
}
