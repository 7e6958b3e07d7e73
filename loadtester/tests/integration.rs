//! Integration tests for the load generator
//!
//! These drive whole runs against the loopback router with tokio's clock
//! paused, so ramp-up, deadlines and speaker intervals are exact.
//!
//! Run with: cargo test --test integration

mod common;

use async_trait::async_trait;
use common::{connector, init_test_logging, load_test, params};
use loadtester::config::{ConfigError, CoupledInput, PublisherMode};
use loadtester::loadtest::{
    EndReason, Layout, LoadTest, LoadTestError, RoleStats, RunPlan, TesterState,
};
use loadtester::media::synth::synthetic_video_clip;
use loadtester::media::{Codec, VideoQuality, VideoSpec};
use loadtester::session::{
    LoopbackConnector, LoopbackOptions, MediaSession, SessionConnector, SessionError,
};
use loadtester::{ClipLibrary, RecordedClip};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Full runs
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_single_room_run_to_deadline() {
    init_test_logging();
    let router = connector(LoopbackOptions::default());
    let load_test = Arc::new(load_test(router.clone()));
    let params = params("lt", 3, 0, 2, Duration::from_secs(15));
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let load_test = load_test.clone();
        let cancel = cancel.clone();
        async move { load_test.run(&params, &cancel).await }
    });

    // Five testers at five per second are all connected within a second
    tokio::time::sleep(Duration::from_secs(1)).await;
    let snapshot = router.room_snapshot("lt").expect("room created");
    assert_eq!(
        snapshot.participants,
        vec!["lt_pub_0", "lt_pub_1", "lt_pub_2", "lt_sub_0", "lt_sub_1"]
    );
    assert_eq!(snapshot.tracks, 3);

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.end_reason, EndReason::Deadline);
    assert_eq!(result.layout, Layout::Speaker);
    assert_eq!(result.rooms, vec!["lt"]);
    assert_eq!((result.attempted(), result.succeeded(), result.failed()), (5, 5, 0));
    assert_eq!(result.publishers.succeeded, 3);
    assert_eq!(result.subscribers.succeeded, 2);
    assert!(result.elapsed >= Duration::from_secs(15));
    assert!(result.elapsed < Duration::from_secs(16));

    assert_eq!(result.testers.len(), 5);
    assert!(result.testers.iter().all(|t| t.state == TesterState::Stopped));
    assert!(result.testers.iter().all(|t| t.errors.is_empty()));

    // Each publisher sends the high simulcast ladder, each subscriber sees all three
    assert_eq!(result.tracks_published, 3);
    assert_eq!(result.tracks_subscribed, 6);
    assert!(result.samples_sent > 0);
    assert!(result.bytes_received > 0);

    // Everyone left the room
    let snapshot = router.room_snapshot("lt").unwrap();
    assert!(snapshot.participants.is_empty());
    assert_eq!(snapshot.tracks, 0);
}

#[tokio::test(start_paused = true)]
async fn test_audio_and_video_publishers() {
    let router = connector(LoopbackOptions::default());
    let load_test = load_test(router.clone());
    let params = params("lt", 1, 3, 1, Duration::from_secs(2));

    let result = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap();

    // Three publishing testers: one with video and audio, two audio only
    assert_eq!(result.publishers.attempted, 3);
    assert_eq!(result.tracks_published, 4);
    assert_eq!(result.tracks_subscribed, 4);
    assert_eq!(result.end_reason, EndReason::Deadline);
}

#[tokio::test(start_paused = true)]
async fn test_multiple_rooms() {
    let router = connector(LoopbackOptions::default());
    let load_test = load_test(router.clone());
    let mut params = params("lt", 2, 2, 1, Duration::from_secs(3));
    params.room_count = 2;
    params.ramp.num_per_second = 0.0;

    let result = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.rooms, vec!["lt_0", "lt_1"]);
    assert_eq!(result.attempted(), 6);
    assert_eq!(result.succeeded(), 6);
    assert_eq!(router.room_names(), vec!["lt_0", "lt_1"]);
    for room in ["lt_0", "lt_1"] {
        let snapshot = router.room_snapshot(room).unwrap();
        assert!(snapshot.samples_forwarded > 0, "no media in {room}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_ends_run() {
    let router = connector(LoopbackOptions::default());
    let load_test = Arc::new(load_test(router));
    // No duration: runs until cancelled
    let params = params("lt", 2, 2, 2, Duration::ZERO);
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let load_test = load_test.clone();
        let cancel = cancel.clone();
        async move { load_test.run(&params, &cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(3)).await;
    cancel.cancel();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.end_reason, EndReason::Cancelled);
    assert_eq!(result.succeeded(), 4);
    assert!(result.elapsed >= Duration::from_secs(3));
    assert!(result.elapsed < Duration::from_secs(4));
    assert!(result.testers.iter().all(|t| t.state == TesterState::Stopped));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_ramp_counts_unlaunched_testers_out() {
    let router = connector(LoopbackOptions::default());
    let load_test = Arc::new(load_test(router));
    let mut params = params("lt", 10, 0, 0, Duration::from_secs(30));
    params.ramp.num_per_second = 1.0;
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let load_test = load_test.clone();
        let cancel = cancel.clone();
        async move { load_test.run(&params, &cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(2500)).await;
    cancel.cancel();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.end_reason, EndReason::Cancelled);
    assert_eq!(result.publishers.attempted, 3);
    assert_eq!(result.testers.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_zero_testers_is_empty_run() {
    let router = connector(LoopbackOptions::default());
    let load_test = load_test(router.clone());
    let params = params("lt", 0, 0, 0, Duration::from_secs(15));

    let result = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.end_reason, EndReason::Empty);
    assert_eq!(result.attempted(), 0);
    assert_eq!(result.elapsed, Duration::ZERO);
    assert!(router.room_names().is_empty());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_connection_failures_are_counted_not_fatal() {
    let router = connector(
        LoopbackOptions::default().reject_identities(|identity| identity == "lt_sub_1"),
    );
    let load_test = load_test(router.clone());
    let params = params("lt", 3, 0, 2, Duration::from_secs(5));

    let result = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.end_reason, EndReason::Deadline);
    assert_eq!((result.attempted(), result.succeeded(), result.failed()), (5, 4, 1));
    assert_eq!(result.subscribers.failed, 1);
    assert_eq!(result.publishers.failed, 0);

    let failed = result
        .testers
        .iter()
        .find(|t| t.identity == "lt_sub_1")
        .unwrap();
    assert_eq!(failed.state, TesterState::Failed);
    assert!(!failed.errors.is_empty());
    assert_eq!(router.connect_counts(), (5, 1));
}

#[tokio::test(start_paused = true)]
async fn test_run_ends_early_when_every_tester_fails() {
    let router = connector(LoopbackOptions::default().reject_identities(|_| true));
    let load_test = load_test(router);
    let params = params("lt", 2, 0, 3, Duration::from_secs(60));

    let result = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.end_reason, EndReason::AllStopped);
    assert_eq!(result.failed(), 5);
    assert_eq!(result.succeeded(), 0);
    assert!(result.elapsed < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_broken_clip_fails_one_publisher_not_the_run() {
    // VP9 high layer ends in a frame one byte short; only odd publishers use VP9
    let spec = VideoSpec::for_quality(VideoQuality::High);
    let clip = synthetic_video_clip(Codec::Vp9, &spec, 10);
    let bytes = clip.as_bytes();
    let mut clips = ClipLibrary::synthetic(32);
    clips.set_video_clip(
        Codec::Vp9,
        VideoQuality::High,
        RecordedClip::from_bytes(bytes.slice(..bytes.len() - 1)),
    );

    let router = connector(LoopbackOptions::default());
    let load_test = Arc::new(load_test(router.clone()).with_clips(Arc::new(clips)));
    let params = params("lt", 3, 0, 1, Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let load_test = load_test.clone();
        let cancel = cancel.clone();
        async move { load_test.run(&params, &cancel).await }
    });

    // The broken publisher left, everyone else is still in the room
    tokio::time::sleep(Duration::from_secs(2)).await;
    let snapshot = router.room_snapshot("lt").unwrap();
    assert_eq!(snapshot.participants.len(), 3);
    assert!(!snapshot.participants.iter().any(|p| p == "lt_pub_1"));
    assert_eq!(snapshot.tracks, 2);

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.end_reason, EndReason::Deadline);
    assert_eq!(
        result.publishers,
        RoleStats {
            attempted: 3,
            succeeded: 2,
            failed: 1,
            cancelled: 0
        }
    );
    assert_eq!(result.subscribers.succeeded, 1);

    for tester in &result.testers {
        if tester.identity == "lt_pub_1" {
            assert_eq!(tester.state, TesterState::Failed);
            assert!(tester.errors[0].contains("frame truncated"), "{:?}", tester.errors);
        } else {
            assert_eq!(tester.state, TesterState::Stopped, "{}", tester.identity);
            assert!(tester.errors.is_empty(), "{:?}", tester.errors);
        }
    }
    let healthy = result
        .testers
        .iter()
        .find(|t| t.identity == "lt_pub_2")
        .unwrap();
    // Over four seconds of the full 15 + 20 + 30 fps ladder
    assert!(healthy.samples_sent > 250, "sent {}", healthy.samples_sent);
}

#[tokio::test(start_paused = true)]
async fn test_overlong_duration_is_rejected() {
    let router = connector(LoopbackOptions::default());
    let load_test = load_test(router.clone());
    let params = params("lt", 1, 0, 1, Duration::from_secs(u64::MAX));

    let err = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LoadTestError::Configuration(ConfigError::InvalidValue { field: "duration", .. })
    ));
    assert!(router.room_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unrepresentable_deadline_runs_until_cancelled() {
    let router = connector(LoopbackOptions::default());
    let load_test = Arc::new(load_test(router.clone()));
    let mut plan = RunPlan::build(&params("lt", 1, 0, 1, Duration::from_secs(5))).unwrap();
    plan.duration = Duration::MAX;
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let load_test = load_test.clone();
        let cancel = cancel.clone();
        async move { load_test.execute(plan, &cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(10)).await;
    cancel.cancel();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.end_reason, EndReason::Cancelled);
    assert_eq!(result.succeeded(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_layout_fails_before_any_room() {
    let router = connector(LoopbackOptions::default());
    let load_test = load_test(router.clone());
    let mut params = params("lt", 1, 1, 1, Duration::from_secs(5));
    params.layout = "hexagon".to_string();

    let err = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LoadTestError::Configuration(ConfigError::UnknownLayout(ref name)) if name == "hexagon"
    ));
    assert!(router.room_names().is_empty());
    assert_eq!(router.connect_counts(), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_room_setup_failure_aborts_run() {
    let router = connector(LoopbackOptions::default().reject_rooms(|room| room == "lt_1"));
    let load_test = load_test(router.clone());
    let mut params = params("lt", 1, 0, 1, Duration::from_secs(5));
    params.room_count = 2;

    let err = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        LoadTestError::RoomSetup { room, source } => {
            assert_eq!(room, "lt_1");
            assert!(matches!(source, SessionError::RoomRejected { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(router.connect_counts(), (0, 0));
}

// ============================================================================
// Coupled mode
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_coupled_mode_requires_parameters() {
    let router = connector(LoopbackOptions::default());
    let load_test = load_test(router.clone());
    let mut params = params("lt", 4, 4, 1, Duration::from_secs(5));
    params.publishers = PublisherMode::Coupled(CoupledInput::default());

    let err = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LoadTestError::Configuration(ConfigError::MissingCoupledParameter(_))
    ));
    assert!(router.room_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_coupled_mode_fixes_publisher_split() {
    let router = connector(LoopbackOptions::default());
    let load_test = load_test(router.clone());
    let mut params = params("lt", 10, 10, 1, Duration::from_secs(2));
    params.publishers = PublisherMode::Coupled(CoupledInput {
        web_width: 640,
        web_height: 360,
        web_bitrate_kbps: 500,
        screen_bitrate_kbps: 1200,
        ..CoupledInput::default()
    });

    let result = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap();

    // Three video publishers, the first two also publishing audio
    assert_eq!(result.publishers.attempted, 3);
    assert_eq!(result.subscribers.attempted, 1);
    assert_eq!(result.tracks_published, 5);
    assert_eq!(result.end_reason, EndReason::Deadline);
}

// ============================================================================
// Speaker simulation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_speaker_simulation_never_repeats_speaker() {
    let router = connector(LoopbackOptions::default());
    let load_test = load_test(router.clone());
    let mut params = params("lt", 3, 0, 2, Duration::from_millis(10_500));
    params.speakers.enabled = true;
    params.speakers.interval = Some(Duration::from_secs(1));
    params.speakers.jitter = 0.0;

    let result = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.speaker_changes, 10);

    let history = router.room_snapshot("lt").unwrap().speaker_history;
    assert_eq!(history.len(), 10);
    assert!(history.windows(2).all(|pair| pair[0] != pair[1]));
    assert!(history.iter().all(|s| s.starts_with("lt_pub_")));

    // Subscribers observed the changes
    let seen: u64 = result
        .testers
        .iter()
        .filter(|t| t.identity.contains("_sub_"))
        .map(|t| t.speaker_changes)
        .sum();
    assert!(seen > 0);
}

#[tokio::test(start_paused = true)]
async fn test_speaker_simulation_disabled_by_default() {
    let router = connector(LoopbackOptions::default());
    let load_test = load_test(router.clone());
    let params = params("lt", 3, 0, 1, Duration::from_secs(5));

    let result = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.speaker_changes, 0);
    assert!(router.room_snapshot("lt").unwrap().speaker_history.is_empty());
}

/// Router whose speaker announcements blow up
struct PanickingSpeakers(Arc<LoopbackConnector>);

#[async_trait]
impl SessionConnector for PanickingSpeakers {
    async fn create_room(&self, room: &str) -> Result<(), SessionError> {
        self.0.create_room(room).await
    }

    async fn connect(
        &self,
        room: &str,
        identity: &str,
    ) -> Result<Arc<dyn MediaSession>, SessionError> {
        self.0.connect(room, identity).await
    }

    async fn announce_speaker(&self, _room: &str, _identity: &str) -> Result<(), SessionError> {
        panic!("speaker announcement exploded");
    }
}

#[tokio::test(start_paused = true)]
async fn test_speaker_task_failure_does_not_fail_run() {
    let router = connector(LoopbackOptions::default());
    let load_test = LoadTest::new(Arc::new(PanickingSpeakers(router.clone())))
        .with_clips(common::shared_clips())
        .with_shutdown_grace(Duration::from_secs(1))
        .with_speaker_seed(7);
    let mut params = params("lt", 2, 0, 1, Duration::from_secs(3));
    params.speakers.enabled = true;
    params.speakers.interval = Some(Duration::from_secs(1));
    params.speakers.jitter = 0.0;

    let result = load_test
        .run(&params, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.end_reason, EndReason::Deadline);
    assert_eq!(result.speaker_changes, 0);
    assert_eq!(result.succeeded(), 3);
}
