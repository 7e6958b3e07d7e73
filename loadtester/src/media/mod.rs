//! Media module
//!
//! Recorded clips, the looping sample source that replays them, and the
//! video/codec descriptions attached to published tracks.

pub mod clip;
pub mod library;
pub mod looper;
pub mod spec;
pub mod synth;
pub mod types;

pub use clip::{ClipCursor, ClipHeader, RecordedClip, Timebase};
pub use library::ClipLibrary;
pub use looper::LoopingMediaSource;
pub use spec::{Codec, CodecDescriptor, VideoLayer, VideoQuality, VideoSpec};
pub use types::{ClipFormatError, MediaError, MediaKind, Sample};
