//! Media session client traits
//!
//! The load generator never speaks the router's signaling or transport
//! protocol itself. It drives a [`SessionConnector`] to join rooms and a
//! [`MediaSession`] per participant to publish samples and subscribe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::media::{CodecDescriptor, MediaKind, Sample, VideoLayer, VideoQuality};

/// Server-assigned track identifier
pub type TrackSid = String;

/// Errors surfaced by the session layer
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Failed to connect {identity} to room {room}: {reason}")]
    ConnectionFailed {
        room: String,
        identity: String,
        reason: String,
    },

    #[error("Room {room} rejected: {reason}")]
    RoomRejected { room: String, reason: String },

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Session closed")]
    Closed,

    #[error("Unknown track: {0}")]
    UnknownTrack(TrackSid),
}

/// Where a track's media nominally comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Camera,
    ScreenShare,
    Microphone,
}

/// Everything needed to publish one track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    pub name: String,
    pub kind: MediaKind,
    pub source: TrackSource,
    pub codec: CodecDescriptor,
    /// Simulcast layers, lowest first; empty for audio
    pub layers: Vec<VideoLayer>,
}

/// A track published by another participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub sid: TrackSid,
    pub publisher: String,
    pub kind: MediaKind,
    pub source: TrackSource,
    pub layers: Vec<VideoLayer>,
}

/// Room activity delivered to subscribers
#[derive(Debug, Clone)]
pub enum RoomEvent {
    TrackPublished(RemoteTrack),
    TrackUnpublished { sid: TrackSid, publisher: String },
    SampleForwarded {
        sid: TrackSid,
        layer: Option<VideoQuality>,
        bytes: usize,
    },
    SpeakerChanged { identity: String },
}

/// Tracks already in the room plus a feed of everything that happens next
pub struct Subscription {
    pub existing: Vec<RemoteTrack>,
    pub events: broadcast::Receiver<RoomEvent>,
}

/// Entry point into the media router
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Create a room ahead of the participants joining it
    async fn create_room(&self, room: &str) -> Result<(), SessionError>;

    /// Join `room` as `identity`
    async fn connect(
        &self,
        room: &str,
        identity: &str,
    ) -> Result<Arc<dyn MediaSession>, SessionError>;

    /// Tell the room that `identity` is now the active speaker
    async fn announce_speaker(&self, room: &str, identity: &str) -> Result<(), SessionError>;
}

/// One participant's live connection
#[async_trait]
pub trait MediaSession: Send + Sync {
    fn identity(&self) -> &str;

    fn room(&self) -> &str;

    /// Announce a new track and get its server-side id
    async fn publish(&self, track: TrackDescriptor) -> Result<TrackSid, SessionError>;

    /// Send one sample on a track; `layer` selects the simulcast layer for video
    async fn write_sample(
        &self,
        sid: &TrackSid,
        layer: Option<VideoQuality>,
        sample: &Sample,
    ) -> Result<(), SessionError>;

    /// Start receiving every track in the room, current and future
    async fn subscribe(&self) -> Result<Subscription, SessionError>;

    /// Ask for a specific layer of a remote video track, or `None` to pause it
    async fn set_subscribed_quality(
        &self,
        sid: &TrackSid,
        quality: Option<VideoQuality>,
    ) -> Result<(), SessionError>;

    /// Layers advertised for a track in the room
    async fn video_layers(&self, sid: &TrackSid) -> Result<Vec<VideoLayer>, SessionError>;

    /// Leave the room; safe to call more than once
    async fn disconnect(&self);
}
