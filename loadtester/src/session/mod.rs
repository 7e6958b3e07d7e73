//! Session layer
//!
//! The traits the load generator drives to reach a media router, and an
//! in-process loopback implementation of them.

pub mod client;
pub mod loopback;

pub use client::{
    MediaSession, RemoteTrack, RoomEvent, SessionConnector, SessionError, Subscription,
    TrackDescriptor, TrackSid, TrackSource,
};
pub use loopback::{LoopbackConnector, LoopbackOptions, RoomSnapshot};
