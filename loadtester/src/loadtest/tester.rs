//! Testers
//!
//! A tester is one simulated participant. It connects to a room, publishes
//! looping media on a fixed cadence, and/or subscribes to the other
//! participants' tracks following a layout.

use metrics::{counter, histogram};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::layout::{Layout, LayoutPlan};
use crate::media::{
    ClipLibrary, Codec, LoopingMediaSource, MediaError, MediaKind, VideoLayer, VideoQuality,
    VideoSpec,
};
use crate::session::{
    MediaSession, RemoteTrack, RoomEvent, SessionConnector, SessionError, TrackDescriptor,
    TrackSid, TrackSource,
};

/// Errors that end a tester or one of its tracks
#[derive(Debug, Error)]
pub enum TesterError {
    #[error("Connection failed: {0}")]
    Connection(SessionError),

    #[error("Publish failed: {0}")]
    Publish(SessionError),

    #[error("Subscribe failed: {0}")]
    Subscribe(SessionError),

    #[error("Media source failed: {0}")]
    Media(#[from] MediaError),

    #[error("Cancelled before connecting")]
    Cancelled,

    #[error("Tester already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TesterState {
    Created,
    Connecting,
    Active,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Publisher,
    Subscriber,
    Both,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
            Role::Both => "both",
        }
    }
}

/// Video track a tester publishes
#[derive(Debug, Clone, PartialEq)]
pub struct VideoPublish {
    pub codec: Codec,
    /// One spec per simulcast layer, lowest first
    pub specs: Vec<VideoSpec>,
    pub source: TrackSource,
}

/// Everything a tester needs to know about its participant
#[derive(Debug, Clone)]
pub struct TesterSpec {
    pub index: usize,
    pub room: String,
    pub identity: String,
    pub video: Option<VideoPublish>,
    pub audio: bool,
    /// Layout applied to remote tracks; `None` disables subscribing
    pub subscribe: Option<LayoutPlan>,
}

impl TesterSpec {
    pub fn role(&self) -> Role {
        let publishes = self.video.is_some() || self.audio;
        match (publishes, self.subscribe.is_some()) {
            (true, true) => Role::Both,
            (true, false) => Role::Publisher,
            _ => Role::Subscriber,
        }
    }

    pub fn publishes(&self) -> bool {
        self.video.is_some() || self.audio
    }
}

/// Counters shared between a tester and its track tasks
#[derive(Debug, Default)]
struct TesterStats {
    samples_sent: AtomicU64,
    bytes_sent: AtomicU64,
    tracks_subscribed: AtomicU64,
    bytes_received: AtomicU64,
    speaker_changes: AtomicU64,
}

/// Final accounting for one tester
#[derive(Debug, Clone, Serialize)]
pub struct TesterReport {
    pub index: usize,
    pub identity: String,
    pub room: String,
    pub role: Role,
    pub state: TesterState,
    pub tracks_published: usize,
    pub samples_sent: u64,
    pub bytes_sent: u64,
    pub tracks_subscribed: u64,
    pub bytes_received: u64,
    pub speaker_changes: u64,
    pub errors: Vec<String>,
}

/// Lifecycle notifications sent to the orchestrator
#[derive(Debug, Clone)]
pub enum TesterEvent {
    Launched {
        index: usize,
        role: Role,
    },
    Connected {
        index: usize,
        role: Role,
        room: String,
        identity: String,
    },
    ConnectFailed {
        index: usize,
        role: Role,
        error: String,
    },
    Cancelled {
        index: usize,
        role: Role,
    },
    /// An active tester lost a track and left the room
    Failed {
        index: usize,
        role: Role,
        error: String,
    },
    Finished(TesterReport),
}

type TrackResult = Result<(), TesterError>;

/// One simulated participant
pub struct Tester {
    spec: TesterSpec,
    connector: Arc<dyn SessionConnector>,
    clips: Arc<ClipLibrary>,
    state: TesterState,
    session: Option<Arc<dyn MediaSession>>,
    cancel: CancellationToken,
    tasks: JoinSet<TrackResult>,
    stats: Arc<TesterStats>,
    tracks_published: usize,
    errors: Vec<String>,
}

impl Tester {
    pub fn new(
        spec: TesterSpec,
        connector: Arc<dyn SessionConnector>,
        clips: Arc<ClipLibrary>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            spec,
            connector,
            clips,
            state: TesterState::Created,
            session: None,
            cancel,
            tasks: JoinSet::new(),
            stats: Arc::new(TesterStats::default()),
            tracks_published: 0,
            errors: Vec::new(),
        }
    }

    pub fn state(&self) -> TesterState {
        self.state
    }

    pub fn identity(&self) -> &str {
        &self.spec.identity
    }

    /// Connect, then start every publish and subscribe task.
    ///
    /// Any failure leaves the tester `Failed` with its session released.
    pub async fn start(&mut self) -> Result<(), TesterError> {
        if self.state != TesterState::Created {
            return Err(TesterError::AlreadyStarted);
        }
        self.state = TesterState::Connecting;
        let role = self.spec.role();

        let started = Instant::now();
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.state = TesterState::Stopped;
                return Err(TesterError::Cancelled);
            }
            result = self.connector.connect(&self.spec.room, &self.spec.identity) => result,
        };

        let session = match connected {
            Ok(session) => session,
            Err(e) => {
                self.fail(&e.to_string());
                return Err(TesterError::Connection(e));
            }
        };
        histogram!("loadtest_connect_duration_seconds").record(started.elapsed());
        self.session = Some(session.clone());

        if let Err(e) = self.launch_tracks(session).await {
            self.fail(&e.to_string());
            self.release().await;
            return Err(e);
        }

        self.state = TesterState::Active;
        counter!("loadtest_testers_started_total", "role" => role.as_str()).increment(1);
        debug!(
            identity = %self.spec.identity,
            room = %self.spec.room,
            role = role.as_str(),
            tracks = self.tracks_published,
            "Tester active"
        );
        Ok(())
    }

    async fn launch_tracks(&mut self, session: Arc<dyn MediaSession>) -> Result<(), TesterError> {
        if let Some(video) = self.spec.video.clone() {
            let mut sources = Vec::with_capacity(video.specs.len());
            for spec in &video.specs {
                let mut source = LoopingMediaSource::video(
                    self.clips.video_clip(video.codec, spec),
                    spec,
                    video.codec,
                );
                source.open().map_err(MediaError::from)?;
                sources.push(source);
            }

            let sid = session
                .publish(TrackDescriptor {
                    name: format!("{}_video", self.spec.identity),
                    kind: MediaKind::Video,
                    source: video.source,
                    codec: video.codec.descriptor(),
                    layers: video.specs.iter().map(VideoSpec::to_layer).collect(),
                })
                .await
                .map_err(TesterError::Publish)?;
            self.tracks_published += 1;

            for source in sources {
                let layer = source.layer().map(|l| l.quality);
                self.tasks.spawn(publish_loop(
                    session.clone(),
                    sid.clone(),
                    layer,
                    MediaKind::Video,
                    source,
                    self.cancel.clone(),
                    self.stats.clone(),
                ));
            }
        }

        if self.spec.audio {
            let mut source = LoopingMediaSource::audio(self.clips.audio_clip());
            source.open().map_err(MediaError::from)?;

            let sid = session
                .publish(TrackDescriptor {
                    name: format!("{}_audio", self.spec.identity),
                    kind: MediaKind::Audio,
                    source: TrackSource::Microphone,
                    codec: source.codec().clone(),
                    layers: Vec::new(),
                })
                .await
                .map_err(TesterError::Publish)?;
            self.tracks_published += 1;

            self.tasks.spawn(publish_loop(
                session.clone(),
                sid,
                None,
                MediaKind::Audio,
                source,
                self.cancel.clone(),
                self.stats.clone(),
            ));
        }

        if let Some(plan) = self.spec.subscribe {
            let subscription = session.subscribe().await.map_err(TesterError::Subscribe)?;
            let view = SubscriberView::new(session.clone(), plan, self.stats.clone());
            self.tasks.spawn(view.run(
                subscription.existing,
                subscription.events,
                self.cancel.clone(),
            ));
        }

        Ok(())
    }

    fn fail(&mut self, reason: &str) {
        self.state = TesterState::Failed;
        self.errors.push(reason.to_string());
        counter!("loadtest_testers_failed_total", "role" => self.spec.role().as_str()).increment(1);
    }

    /// Wait until the tester is cancelled or one of its tracks ends in error.
    ///
    /// A track error takes the whole tester down: the remaining tracks are
    /// stopped, the session is released and the tester ends `Failed` with the
    /// error that caused it. Returns the error in that case.
    pub async fn supervise(&mut self) -> Option<String> {
        if self.state != TesterState::Active {
            return None;
        }

        let failure = loop {
            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                joined = self.tasks.join_next() => joined,
            };
            match joined {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => break e.to_string(),
                Some(Err(e)) => break format!("track task aborted: {e}"),
                None => {
                    self.cancel.cancelled().await;
                    return None;
                }
            }
        };

        warn!(
            identity = %self.spec.identity,
            room = %self.spec.room,
            "Track failed, stopping tester: {}",
            failure
        );
        self.fail(&failure);
        self.release().await;
        Some(failure)
    }

    /// Stop every track task and leave the room. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        match self.state {
            TesterState::Stopped | TesterState::Failed | TesterState::Stopping => return,
            TesterState::Created => {
                self.state = TesterState::Stopped;
                return;
            }
            TesterState::Connecting | TesterState::Active => {}
        }

        self.state = TesterState::Stopping;
        self.release().await;
        self.state = TesterState::Stopped;
    }

    /// Cancel and join the track tasks, then disconnect
    async fn release(&mut self) {
        self.cancel.cancel();
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.errors.push(e.to_string()),
                Err(e) => self.errors.push(format!("track task aborted: {e}")),
            }
        }
        if let Some(session) = self.session.take() {
            session.disconnect().await;
        }
    }

    pub fn report(&self) -> TesterReport {
        TesterReport {
            index: self.spec.index,
            identity: self.spec.identity.clone(),
            room: self.spec.room.clone(),
            role: self.spec.role(),
            state: self.state,
            tracks_published: self.tracks_published,
            samples_sent: self.stats.samples_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            tracks_subscribed: self.stats.tracks_subscribed.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            speaker_changes: self.stats.speaker_changes.load(Ordering::Relaxed),
            errors: self.errors.clone(),
        }
    }
}

/// Pull samples from `source` and write them at the cadence the samples dictate
async fn publish_loop(
    session: Arc<dyn MediaSession>,
    sid: TrackSid,
    layer: Option<VideoQuality>,
    kind: MediaKind,
    mut source: LoopingMediaSource,
    cancel: CancellationToken,
    stats: Arc<TesterStats>,
) -> TrackResult {
    let mut next_at = Instant::now();
    loop {
        let sample = source.next_sample()?;
        session
            .write_sample(&sid, layer, &sample)
            .await
            .map_err(TesterError::Publish)?;

        stats.samples_sent.fetch_add(1, Ordering::Relaxed);
        stats
            .bytes_sent
            .fetch_add(sample.len() as u64, Ordering::Relaxed);
        counter!("loadtest_samples_sent_total", "kind" => kind.as_str()).increment(1);
        counter!("loadtest_bytes_sent_total", "kind" => kind.as_str())
            .increment(sample.len() as u64);

        next_at += sample.duration;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!(sid = %sid, loops = source.loops(), "Publish loop stopped");
                return Ok(());
            }
            _ = tokio::time::sleep_until(next_at) => {}
        }
    }
}

/// Subscriber-side state: which remote tracks are rendered and at what quality
struct SubscriberView {
    session: Arc<dyn MediaSession>,
    plan: LayoutPlan,
    stats: Arc<TesterStats>,
    /// Remote video tracks in tile order
    tiles: Vec<RemoteTrack>,
    requested: HashMap<TrackSid, Option<VideoQuality>>,
    audio: HashSet<TrackSid>,
}

impl SubscriberView {
    fn new(session: Arc<dyn MediaSession>, plan: LayoutPlan, stats: Arc<TesterStats>) -> Self {
        Self {
            session,
            plan,
            stats,
            tiles: Vec::new(),
            requested: HashMap::new(),
            audio: HashSet::new(),
        }
    }

    async fn run(
        mut self,
        existing: Vec<RemoteTrack>,
        mut events: broadcast::Receiver<RoomEvent>,
        cancel: CancellationToken,
    ) -> TrackResult {
        for track in existing {
            self.add_track(track).await?;
        }
        self.apply_layout().await?;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => event,
            };

            match event {
                Ok(event) => self.handle(event).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(skipped, "Subscriber lagged behind room events");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn handle(&mut self, event: RoomEvent) -> TrackResult {
        match event {
            RoomEvent::TrackPublished(track) => {
                if track.publisher != self.session.identity() {
                    self.add_track(track).await?;
                    self.apply_layout().await?;
                }
            }
            RoomEvent::TrackUnpublished { sid, .. } => {
                self.audio.remove(&sid);
                self.requested.remove(&sid);
                let before = self.tiles.len();
                self.tiles.retain(|t| t.sid != sid);
                if self.tiles.len() != before {
                    self.apply_layout().await?;
                }
            }
            RoomEvent::SampleForwarded { sid, layer, bytes } => {
                let receiving = self.audio.contains(&sid)
                    || matches!(self.requested.get(&sid), Some(Some(q)) if Some(*q) == layer);
                if receiving {
                    self.stats
                        .bytes_received
                        .fetch_add(bytes as u64, Ordering::Relaxed);
                }
            }
            RoomEvent::SpeakerChanged { identity } => {
                self.stats.speaker_changes.fetch_add(1, Ordering::Relaxed);
                if self.plan.layout == Layout::Speaker
                    && let Some(pos) = self.tiles.iter().position(|t| t.publisher == identity)
                    && pos > 0
                {
                    let track = self.tiles.remove(pos);
                    self.tiles.insert(0, track);
                    self.apply_layout().await?;
                }
            }
        }
        Ok(())
    }

    /// Track a remote track; video tiles take the layers the room advertises
    async fn add_track(&mut self, mut track: RemoteTrack) -> TrackResult {
        if self.audio.contains(&track.sid) || self.tiles.iter().any(|t| t.sid == track.sid) {
            return Ok(());
        }
        if track.kind == MediaKind::Video {
            match self.session.video_layers(&track.sid).await {
                Ok(layers) => track.layers = layers,
                // Unpublished before we got to it
                Err(SessionError::UnknownTrack(_)) => return Ok(()),
                Err(e) => return Err(TesterError::Subscribe(e)),
            }
        }

        self.stats.tracks_subscribed.fetch_add(1, Ordering::Relaxed);
        match track.kind {
            MediaKind::Audio => {
                self.audio.insert(track.sid);
            }
            MediaKind::Video => self.tiles.push(track),
        }
        Ok(())
    }

    /// Request the layout's quality for every tile whose slot changed
    async fn apply_layout(&mut self) -> TrackResult {
        for (slot, track) in self.tiles.iter().enumerate() {
            let quality = available_quality(&track.layers, self.plan.quality_for_slot(slot));
            if self.requested.get(&track.sid) == Some(&quality) {
                continue;
            }
            match self.session.set_subscribed_quality(&track.sid, quality).await {
                Ok(()) => {
                    self.requested.insert(track.sid.clone(), quality);
                }
                // The track went away between the event and this request
                Err(SessionError::UnknownTrack(_)) => {}
                Err(e) => return Err(TesterError::Subscribe(e)),
            }
        }
        Ok(())
    }
}

/// Best layer the publisher sends at or below `wanted`, else its lowest one.
/// Tracks without layer metadata get `wanted` as is.
fn available_quality(layers: &[VideoLayer], wanted: Option<VideoQuality>) -> Option<VideoQuality> {
    let wanted = wanted?;
    let qualities = layers.iter().map(|l| l.quality);
    qualities
        .clone()
        .filter(|q| *q <= wanted)
        .max()
        .or_else(|| qualities.min())
        .or(Some(wanted))
}

/// Run one tester until `cancel` fires or a track fails, reporting progress on `events`
pub async fn run_tester(
    spec: TesterSpec,
    connector: Arc<dyn SessionConnector>,
    clips: Arc<ClipLibrary>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<TesterEvent>,
) {
    let index = spec.index;
    let role = spec.role();
    let room = spec.room.clone();
    let identity = spec.identity.clone();
    let mut tester = Tester::new(spec, connector, clips, cancel.child_token());

    // Send errors mean the orchestrator stopped listening; the tester still cleans up
    let _ = events.send(TesterEvent::Launched { index, role });

    match tester.start().await {
        Ok(()) => {
            let _ = events.send(TesterEvent::Connected {
                index,
                role,
                room,
                identity,
            });
            if let Some(error) = tester.supervise().await {
                let _ = events.send(TesterEvent::Failed { index, role, error });
            }
        }
        Err(TesterError::Cancelled) => {
            let _ = events.send(TesterEvent::Cancelled { index, role });
        }
        Err(e) => {
            warn!(identity = %identity, room = %room, "Tester failed to start: {}", e);
            let _ = events.send(TesterEvent::ConnectFailed {
                index,
                role,
                error: e.to_string(),
            });
        }
    }

    tester.stop().await;
    let report = tester.report();
    if !report.errors.is_empty() && report.state == TesterState::Stopped {
        info!(identity = %report.identity, errors = ?report.errors, "Tester stopped with track errors");
    }
    let _ = events.send(TesterEvent::Finished(report));
}
