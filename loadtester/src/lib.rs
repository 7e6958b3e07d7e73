//! Synthetic load generator for real-time media rooms
//!
//! Simulated participants join rooms at a controlled rate, publish looping
//! recorded media, subscribe to each other following a layout, and report
//! what they sent and received.

pub mod config;
pub mod loadtest;
pub mod media;
pub mod session;

// Re-export commonly used types
pub use config::{ConfigError, CoupledInput, LoadTestParams, PublisherMode, RuntimeConfig};
pub use loadtest::{LoadTest, LoadTestError, RunResult, run_suite};
pub use media::{ClipLibrary, LoopingMediaSource, RecordedClip};
pub use session::{LoopbackConnector, LoopbackOptions, SessionConnector};
