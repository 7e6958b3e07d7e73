//! Layouts
//!
//! A layout decides which remote video tracks a subscriber renders and at
//! which quality, and how often the simulated active speaker changes.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::config::ConfigError;
use crate::media::VideoQuality;

/// Thumbnails shown under the main tile in speaker layout
const SPEAKER_THUMBNAILS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Layout {
    #[serde(rename = "speaker")]
    Speaker,
    #[serde(rename = "3x3")]
    Grid3x3,
    #[serde(rename = "4x4")]
    Grid4x4,
    #[serde(rename = "5x5")]
    Grid5x5,
}

impl Layout {
    pub const ALL: [Layout; 4] = [
        Layout::Speaker,
        Layout::Grid3x3,
        Layout::Grid4x4,
        Layout::Grid5x5,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Layout::Speaker => "speaker",
            Layout::Grid3x3 => "3x3",
            Layout::Grid4x4 => "4x4",
            Layout::Grid5x5 => "5x5",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|layout| layout.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolved layout policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayoutPlan {
    pub layout: Layout,
    /// Remote video tracks rendered at once
    pub visible_tiles: usize,
    pub recommended_publishers: usize,
    pub recommended_subscribers: usize,
    /// Default period between simulated speaker changes
    pub rotation_interval: Duration,
}

impl LayoutPlan {
    /// Look up a layout by name
    pub fn resolve(name: &str) -> Result<Self, ConfigError> {
        let layout =
            Layout::from_name(name).ok_or_else(|| ConfigError::UnknownLayout(name.to_string()))?;
        Ok(Self::for_layout(layout))
    }

    pub fn for_layout(layout: Layout) -> Self {
        let (visible_tiles, recommended_subscribers, rotation_secs) = match layout {
            Layout::Speaker => (1 + SPEAKER_THUMBNAILS, 50, 2),
            Layout::Grid3x3 => (9, 9, 3),
            Layout::Grid4x4 => (16, 16, 4),
            Layout::Grid5x5 => (25, 25, 5),
        };
        Self {
            layout,
            visible_tiles,
            recommended_publishers: visible_tiles,
            recommended_subscribers,
            rotation_interval: Duration::from_secs(rotation_secs),
        }
    }

    /// Quality requested for the remote video track in `slot` (0-based, in
    /// publish order), or `None` when the track is not rendered.
    pub fn quality_for_slot(&self, slot: usize) -> Option<VideoQuality> {
        if slot >= self.visible_tiles {
            return None;
        }
        match self.layout {
            Layout::Speaker if slot == 0 => Some(VideoQuality::High),
            Layout::Speaker => Some(VideoQuality::Low),
            Layout::Grid3x3 => Some(VideoQuality::Medium),
            Layout::Grid4x4 | Layout::Grid5x5 => Some(VideoQuality::Low),
        }
    }
}
