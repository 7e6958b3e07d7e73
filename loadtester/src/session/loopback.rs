//! In-process loopback router
//!
//! Implements the session traits without any network transport: rooms live in
//! memory, published samples are fanned out to subscribers over a broadcast
//! channel, and connection failures can be injected. Used for dry runs of the
//! load generator itself and by the tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use super::client::{
    MediaSession, RemoteTrack, RoomEvent, SessionConnector, SessionError, Subscription,
    TrackDescriptor, TrackSid,
};
use crate::media::{MediaKind, Sample, VideoLayer, VideoQuality};

type Predicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Behavior knobs for the loopback router
#[derive(Clone)]
pub struct LoopbackOptions {
    /// Simulated signaling round trip per connect
    pub connect_latency: Duration,
    /// Probability in `[0, 1]` that a connect attempt fails
    pub failure_rate: f64,
    /// Per-room event buffer; slow subscribers skip ahead when it overflows
    pub event_capacity: usize,
    reject_identity: Option<Predicate>,
    reject_room: Option<Predicate>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            connect_latency: Duration::ZERO,
            failure_rate: 0.0,
            event_capacity: 1024,
            reject_identity: None,
            reject_room: None,
        }
    }
}

impl LoopbackOptions {
    pub fn with_connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Refuse connections for identities matching `predicate`
    pub fn reject_identities(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.reject_identity = Some(Arc::new(predicate));
        self
    }

    /// Refuse to create rooms whose name matches `predicate`
    pub fn reject_rooms(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.reject_room = Some(Arc::new(predicate));
        self
    }
}

struct LoopbackRoom {
    name: String,
    events: broadcast::Sender<RoomEvent>,
    participants: DashMap<String, ()>,
    tracks: DashMap<TrackSid, RemoteTrack>,
    requested: DashMap<(String, TrackSid), Option<VideoQuality>>,
    speakers: Mutex<Vec<String>>,
    samples: AtomicU64,
    bytes: AtomicU64,
}

impl LoopbackRoom {
    fn new(name: &str, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.to_string(),
            events,
            participants: DashMap::new(),
            tracks: DashMap::new(),
            requested: DashMap::new(),
            speakers: Mutex::new(Vec::new()),
            samples: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    fn emit(&self, event: RoomEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

/// Point-in-time view of a loopback room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub name: String,
    pub participants: Vec<String>,
    pub tracks: usize,
    pub samples_forwarded: u64,
    pub bytes_forwarded: u64,
    pub speaker_history: Vec<String>,
}

/// Loopback implementation of [`SessionConnector`]
pub struct LoopbackConnector {
    rooms: DashMap<String, Arc<LoopbackRoom>>,
    options: LoopbackOptions,
    connects: AtomicU64,
    rejected: AtomicU64,
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl LoopbackConnector {
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            rooms: DashMap::new(),
            options,
            connects: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn room_or_create(&self, name: &str) -> Arc<LoopbackRoom> {
        self.rooms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LoopbackRoom::new(name, self.options.event_capacity)))
            .clone()
    }

    /// Names of every room created so far, sorted
    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    pub fn room_snapshot(&self, name: &str) -> Option<RoomSnapshot> {
        let room = self.rooms.get(name)?.clone();
        let mut participants: Vec<String> =
            room.participants.iter().map(|p| p.key().clone()).collect();
        participants.sort();
        let speaker_history = room
            .speakers
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();

        Some(RoomSnapshot {
            name: room.name.clone(),
            participants,
            tracks: room.tracks.len(),
            samples_forwarded: room.samples.load(Ordering::Relaxed),
            bytes_forwarded: room.bytes.load(Ordering::Relaxed),
            speaker_history,
        })
    }

    /// Tracks currently published in a room, ordered by publisher
    pub fn room_tracks(&self, name: &str) -> Vec<RemoteTrack> {
        let Some(room) = self.rooms.get(name).map(|r| r.clone()) else {
            return Vec::new();
        };
        let mut tracks: Vec<RemoteTrack> = room.tracks.iter().map(|t| t.value().clone()).collect();
        tracks.sort_by(|a, b| a.publisher.cmp(&b.publisher).then(a.sid.cmp(&b.sid)));
        tracks
    }

    /// Quality `identity` last requested for `sid`, if any request was made
    pub fn requested_quality(
        &self,
        room: &str,
        identity: &str,
        sid: &str,
    ) -> Option<Option<VideoQuality>> {
        let room = self.rooms.get(room)?.clone();
        room.requested
            .get(&(identity.to_string(), sid.to_string()))
            .map(|q| *q)
    }

    /// Connect attempts made and how many were refused
    pub fn connect_counts(&self) -> (u64, u64) {
        (
            self.connects.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }

    fn should_reject(&self, identity: &str) -> bool {
        if let Some(ref reject) = self.options.reject_identity
            && reject(identity)
        {
            return true;
        }
        self.options.failure_rate > 0.0 && rand::random::<f64>() < self.options.failure_rate
    }
}

#[async_trait]
impl SessionConnector for LoopbackConnector {
    async fn create_room(&self, room: &str) -> Result<(), SessionError> {
        if let Some(ref reject) = self.options.reject_room
            && reject(room)
        {
            return Err(SessionError::RoomRejected {
                room: room.to_string(),
                reason: "rejected by loopback policy".to_string(),
            });
        }
        self.room_or_create(room);
        info!("Created loopback room {}", room);
        Ok(())
    }

    async fn connect(
        &self,
        room: &str,
        identity: &str,
    ) -> Result<Arc<dyn MediaSession>, SessionError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        if !self.options.connect_latency.is_zero() {
            tokio::time::sleep(self.options.connect_latency).await;
        }

        if self.should_reject(identity) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SessionError::ConnectionFailed {
                room: room.to_string(),
                identity: identity.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let room = self.room_or_create(room);
        room.participants.insert(identity.to_string(), ());
        debug!("{} joined loopback room {}", identity, room.name);

        Ok(Arc::new(LoopbackSession {
            room,
            identity: identity.to_string(),
            published: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn announce_speaker(&self, room: &str, identity: &str) -> Result<(), SessionError> {
        let room = self
            .rooms
            .get(room)
            .map(|r| r.clone())
            .ok_or_else(|| SessionError::RoomNotFound(room.to_string()))?;
        if let Ok(mut speakers) = room.speakers.lock() {
            speakers.push(identity.to_string());
        }
        room.emit(RoomEvent::SpeakerChanged {
            identity: identity.to_string(),
        });
        Ok(())
    }
}

struct LoopbackSession {
    room: Arc<LoopbackRoom>,
    identity: String,
    published: Mutex<Vec<TrackSid>>,
    closed: AtomicBool,
}

impl LoopbackSession {
    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl MediaSession for LoopbackSession {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn room(&self) -> &str {
        &self.room.name
    }

    async fn publish(&self, track: TrackDescriptor) -> Result<TrackSid, SessionError> {
        self.ensure_open()?;
        let sid = format!("TR_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let remote = RemoteTrack {
            sid: sid.clone(),
            publisher: self.identity.clone(),
            kind: track.kind,
            source: track.source,
            layers: track.layers,
        };
        self.room.tracks.insert(sid.clone(), remote.clone());
        if let Ok(mut published) = self.published.lock() {
            published.push(sid.clone());
        }
        self.room.emit(RoomEvent::TrackPublished(remote));
        debug!(
            "{} published {} track {} ({})",
            self.identity,
            track.kind.as_str(),
            sid,
            track.codec.mime_type
        );
        Ok(sid)
    }

    async fn write_sample(
        &self,
        sid: &TrackSid,
        layer: Option<VideoQuality>,
        sample: &Sample,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.room.tracks.contains_key(sid) {
            return Err(SessionError::UnknownTrack(sid.clone()));
        }
        self.room.samples.fetch_add(1, Ordering::Relaxed);
        self.room
            .bytes
            .fetch_add(sample.len() as u64, Ordering::Relaxed);
        self.room.emit(RoomEvent::SampleForwarded {
            sid: sid.clone(),
            layer,
            bytes: sample.len(),
        });
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, SessionError> {
        self.ensure_open()?;
        // Subscribe first so nothing published in between is missed
        let events = self.room.events.subscribe();
        let existing = self
            .room
            .tracks
            .iter()
            .filter(|t| t.publisher != self.identity)
            .map(|t| t.value().clone())
            .collect();
        Ok(Subscription { existing, events })
    }

    async fn set_subscribed_quality(
        &self,
        sid: &TrackSid,
        quality: Option<VideoQuality>,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let track = self
            .room
            .tracks
            .get(sid)
            .ok_or_else(|| SessionError::UnknownTrack(sid.clone()))?;
        if track.kind != MediaKind::Video {
            return Ok(());
        }
        drop(track);
        self.room
            .requested
            .insert((self.identity.clone(), sid.clone()), quality);
        Ok(())
    }

    async fn video_layers(&self, sid: &TrackSid) -> Result<Vec<VideoLayer>, SessionError> {
        self.room
            .tracks
            .get(sid)
            .map(|t| t.layers.clone())
            .ok_or_else(|| SessionError::UnknownTrack(sid.clone()))
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let published = self
            .published
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default();
        for sid in published {
            self.room.tracks.remove(&sid);
            self.room.emit(RoomEvent::TrackUnpublished {
                sid,
                publisher: self.identity.clone(),
            });
        }
        self.room.participants.remove(&self.identity);
        debug!("{} left loopback room {}", self.identity, self.room.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Codec, CodecDescriptor, VideoSpec};
    use crate::session::client::TrackSource;
    use bytes::Bytes;

    fn video_track() -> TrackDescriptor {
        TrackDescriptor {
            name: "camera".to_string(),
            kind: MediaKind::Video,
            source: TrackSource::Camera,
            codec: Codec::Vp8.descriptor(),
            layers: vec![VideoSpec::for_quality(VideoQuality::Low).to_layer()],
        }
    }

    fn sample(len: usize) -> Sample {
        Sample {
            data: Bytes::from(vec![0u8; len]),
            duration: Duration::from_millis(33),
        }
    }

    #[tokio::test]
    async fn test_samples_fan_out_to_subscribers() {
        let connector = LoopbackConnector::default();
        connector.create_room("lt").await.unwrap();

        let publisher = connector.connect("lt", "pub_0").await.unwrap();
        let subscriber = connector.connect("lt", "sub_0").await.unwrap();

        let sid = publisher.publish(video_track()).await.unwrap();
        let mut subscription = subscriber.subscribe().await.unwrap();
        assert_eq!(subscription.existing.len(), 1);
        assert_eq!(subscription.existing[0].publisher, "pub_0");

        publisher
            .write_sample(&sid, Some(VideoQuality::Low), &sample(100))
            .await
            .unwrap();

        match subscription.events.recv().await.unwrap() {
            RoomEvent::SampleForwarded {
                sid: got,
                layer,
                bytes,
            } => {
                assert_eq!(got, sid);
                assert_eq!(layer, Some(VideoQuality::Low));
                assert_eq!(bytes, 100);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let snapshot = connector.room_snapshot("lt").unwrap();
        assert_eq!(snapshot.participants, vec!["pub_0", "sub_0"]);
        assert_eq!(snapshot.samples_forwarded, 1);
        assert_eq!(snapshot.bytes_forwarded, 100);
    }

    #[tokio::test]
    async fn test_disconnect_unpublishes_and_is_idempotent() {
        let connector = LoopbackConnector::default();
        let publisher = connector.connect("lt", "pub_0").await.unwrap();
        let sid = publisher.publish(video_track()).await.unwrap();

        publisher.disconnect().await;
        publisher.disconnect().await;

        let snapshot = connector.room_snapshot("lt").unwrap();
        assert!(snapshot.participants.is_empty());
        assert_eq!(snapshot.tracks, 0);
        assert!(matches!(
            publisher.write_sample(&sid, None, &sample(10)).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_rejections() {
        let connector = LoopbackConnector::new(
            LoopbackOptions::default()
                .reject_identities(|id| id.ends_with("_3"))
                .reject_rooms(|room| room == "forbidden"),
        );

        assert!(connector.connect("lt", "sub_1").await.is_ok());
        assert!(matches!(
            connector.connect("lt", "sub_3").await,
            Err(SessionError::ConnectionFailed { .. })
        ));
        assert!(matches!(
            connector.create_room("forbidden").await,
            Err(SessionError::RoomRejected { .. })
        ));
        assert_eq!(connector.connect_counts(), (2, 1));
    }

    #[tokio::test]
    async fn test_requested_quality_is_recorded_for_video_only() {
        let connector = LoopbackConnector::default();
        let publisher = connector.connect("lt", "pub_0").await.unwrap();
        let subscriber = connector.connect("lt", "sub_0").await.unwrap();

        let video = publisher.publish(video_track()).await.unwrap();
        let audio = publisher
            .publish(TrackDescriptor {
                name: "mic".to_string(),
                kind: MediaKind::Audio,
                source: TrackSource::Microphone,
                codec: CodecDescriptor::opus(),
                layers: Vec::new(),
            })
            .await
            .unwrap();

        subscriber
            .set_subscribed_quality(&video, Some(VideoQuality::High))
            .await
            .unwrap();
        subscriber
            .set_subscribed_quality(&audio, Some(VideoQuality::High))
            .await
            .unwrap();

        assert_eq!(
            connector.requested_quality("lt", "sub_0", &video),
            Some(Some(VideoQuality::High))
        );
        assert_eq!(connector.requested_quality("lt", "sub_0", &audio), None);
        assert_eq!(subscriber.video_layers(&video).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_speaker_announcements_need_a_room() {
        let connector = LoopbackConnector::default();
        assert!(matches!(
            connector.announce_speaker("missing", "pub_0").await,
            Err(SessionError::RoomNotFound(_))
        ));

        connector.create_room("lt").await.unwrap();
        connector.announce_speaker("lt", "pub_0").await.unwrap();
        connector.announce_speaker("lt", "pub_1").await.unwrap();
        assert_eq!(
            connector.room_snapshot("lt").unwrap().speaker_history,
            vec!["pub_0", "pub_1"]
        );
    }
}
