//! Common Test Utilities for Integration Tests
//!
//! Shared helpers used across integration test modules.

use loadtester::loadtest::LoadTest;
use loadtester::session::{LoopbackConnector, LoopbackOptions};
use loadtester::{ClipLibrary, LoadTestParams};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Synthetic clips shared by every test in the binary
pub fn shared_clips() -> Arc<ClipLibrary> {
    static CLIPS: OnceLock<Arc<ClipLibrary>> = OnceLock::new();
    CLIPS
        .get_or_init(|| Arc::new(ClipLibrary::synthetic(32)))
        .clone()
}

/// Loopback router with the given options
pub fn connector(options: LoopbackOptions) -> Arc<LoopbackConnector> {
    Arc::new(LoopbackConnector::new(options))
}

/// Load test over `connector` with shared clips and a short shutdown grace
pub fn load_test(connector: Arc<LoopbackConnector>) -> LoadTest {
    LoadTest::new(connector)
        .with_clips(shared_clips())
        .with_shutdown_grace(Duration::from_secs(1))
        .with_speaker_seed(7)
}

/// Single-room parameters with a fixed identity prefix
pub fn params(
    room: &str,
    video: usize,
    audio: usize,
    subscribers: usize,
    duration: Duration,
) -> LoadTestParams {
    LoadTestParams {
        room: room.to_string(),
        duration,
        subscribers,
        identity_prefix: Some("lt".to_string()),
        ..LoadTestParams::default()
    }
    .with_publishers(video, audio)
}

/// Initialize test logging for detailed output
#[allow(dead_code)]
pub fn init_test_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loadtester=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
