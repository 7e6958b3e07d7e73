//! Media-related types and error definitions

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Reasons a recorded clip cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClipFormatError {
    #[error("clip signature {0:?} is not DKIF")]
    BadSignature([u8; 4]),

    #[error("unsupported clip version {0}")]
    UnsupportedVersion(u16),

    #[error("clip header truncated: {len} bytes, need {needed}")]
    TruncatedHeader { len: usize, needed: usize },

    #[error("clip contains no frames")]
    EmptyClip,

    #[error("frame truncated at offset {offset}: expected {expected} bytes, {available} available")]
    TruncatedFrame {
        offset: usize,
        expected: usize,
        available: usize,
    },

    #[error("clip timebase has a zero denominator")]
    ZeroTimebase,
}

/// Errors that can occur while loading or pulling media
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Malformed clip: {0}")]
    ClipFormat(#[from] ClipFormatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One encoded frame handed to the session client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Encoded payload, a slice of the shared clip buffer
    pub data: Bytes,
    /// How long the publisher waits before pulling the next sample
    pub duration: Duration,
}

impl Sample {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}
