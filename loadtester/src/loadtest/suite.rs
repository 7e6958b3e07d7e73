//! Preset scenario suite

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::orchestrator::{LoadTest, LoadTestError};
use super::plan::RunPlan;
use super::report::{EndReason, RunResult};
use crate::config::{LoadTestParams, PublisherMode};

/// Scenario duration when none is configured
pub const DEFAULT_SCENARIO_DURATION: Duration = Duration::from_secs(15);

/// One preset scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scenario {
    pub name: &'static str,
    pub video_publishers: usize,
    pub audio_publishers: usize,
    pub subscribers: usize,
    pub layout: &'static str,
}

/// The fixed battery, run in this order
pub const SUITE: [Scenario; 6] = [
    Scenario {
        name: "speaker-1x10",
        video_publishers: 1,
        audio_publishers: 1,
        subscribers: 10,
        layout: "speaker",
    },
    Scenario {
        name: "speaker-3x25",
        video_publishers: 3,
        audio_publishers: 3,
        subscribers: 25,
        layout: "speaker",
    },
    Scenario {
        name: "grid-3x3",
        video_publishers: 9,
        audio_publishers: 9,
        subscribers: 9,
        layout: "3x3",
    },
    Scenario {
        name: "grid-4x4",
        video_publishers: 16,
        audio_publishers: 16,
        subscribers: 16,
        layout: "4x4",
    },
    Scenario {
        name: "grid-5x5",
        video_publishers: 25,
        audio_publishers: 25,
        subscribers: 25,
        layout: "5x5",
    },
    Scenario {
        name: "audio-only-10x50",
        video_publishers: 0,
        audio_publishers: 10,
        subscribers: 50,
        layout: "speaker",
    },
];

impl Scenario {
    /// Parameters for this scenario, inheriting everything else from `base`
    pub fn params(&self, base: &LoadTestParams) -> LoadTestParams {
        let mut params = base.clone();
        params.room = format!("{}-{}", base.room, self.name);
        params.publishers = PublisherMode::Independent {
            video: self.video_publishers,
            audio: self.audio_publishers,
        };
        params.subscribers = self.subscribers;
        params.layout = self.layout.to_string();
        if params.duration.is_zero() {
            params.duration = DEFAULT_SCENARIO_DURATION;
        }
        params
    }
}

/// Run the preset suite
pub async fn run_suite(
    load_test: &LoadTest,
    base: &LoadTestParams,
    cancel: &CancellationToken,
) -> Result<Vec<RunResult>, LoadTestError> {
    run_scenarios(load_test, base, &SUITE, cancel).await
}

/// Run `scenarios` one after another.
///
/// A run-level error stops the suite and is returned together with the
/// results gathered so far. Cancellation ends the suite after the current
/// scenario.
pub async fn run_scenarios(
    load_test: &LoadTest,
    base: &LoadTestParams,
    scenarios: &[Scenario],
    cancel: &CancellationToken,
) -> Result<Vec<RunResult>, LoadTestError> {
    let mut completed = Vec::with_capacity(scenarios.len());

    for (i, scenario) in scenarios.iter().enumerate() {
        info!(
            "Running scenario {}/{}: {}",
            i + 1,
            scenarios.len(),
            scenario.name
        );

        let outcome = match RunPlan::build(&scenario.params(base)) {
            Ok(plan) => {
                load_test
                    .execute(plan.with_scenario(scenario.name), cancel)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(result) => {
                let cancelled = result.end_reason == EndReason::Cancelled;
                completed.push(result);
                if cancelled {
                    info!("Suite cancelled after scenario {}", scenario.name);
                    break;
                }
            }
            Err(e) => {
                error!("Scenario {} failed: {}", scenario.name, e);
                return Err(LoadTestError::SuiteAborted {
                    scenario: scenario.name.to_string(),
                    completed,
                    source: Box::new(e),
                });
            }
        }
    }

    Ok(completed)
}
