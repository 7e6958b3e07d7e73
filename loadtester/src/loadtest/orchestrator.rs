//! Load test orchestrator
//!
//! Runs one [`RunPlan`]: creates the rooms, ramps testers up, drives speaker
//! simulation, waits for the deadline or cancellation, then stops every
//! tester and folds their reports into a [`RunResult`].

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::plan::RunPlan;
use super::ramp::RampSchedule;
use super::report::{EndReason, RunResult, RunTally};
use super::speaker::{RosterUpdate, SpeakerSimulator};
use super::tester::{Role, TesterEvent, TesterSpec, run_tester};
use crate::config::{ConfigError, LoadTestParams};
use crate::media::{ClipLibrary, MediaError};
use crate::session::{SessionConnector, SessionError};

/// Run-level failures. Tester failures never show up here.
#[derive(Debug, Error)]
pub enum LoadTestError {
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Failed to load clips: {0}")]
    Media(#[from] MediaError),

    #[error("Failed to set up room {room}: {source}")]
    RoomSetup {
        room: String,
        #[source]
        source: SessionError,
    },

    #[error("Scenario {scenario} aborted the suite after {} completed: {source}", .completed.len())]
    SuiteAborted {
        scenario: String,
        completed: Vec<RunResult>,
        #[source]
        source: Box<LoadTestError>,
    },
}

/// Load test runner bound to a session backend
pub struct LoadTest {
    connector: Arc<dyn SessionConnector>,
    shutdown_grace: Duration,
    clips: Option<Arc<ClipLibrary>>,
    speaker_seed: Option<u64>,
}

impl LoadTest {
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            connector,
            shutdown_grace: Duration::from_secs(5),
            clips: None,
            speaker_seed: None,
        }
    }

    /// Upper bound on waiting for testers to report after the run ends
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Use these clips instead of loading them for every run
    pub fn with_clips(mut self, clips: Arc<ClipLibrary>) -> Self {
        self.clips = Some(clips);
        self
    }

    /// Make speaker selection reproducible
    pub fn with_speaker_seed(mut self, seed: u64) -> Self {
        self.speaker_seed = Some(seed);
        self
    }

    /// Validate `params` and run them until the deadline or `cancel`
    pub async fn run(
        &self,
        params: &LoadTestParams,
        cancel: &CancellationToken,
    ) -> Result<RunResult, LoadTestError> {
        let plan = RunPlan::build(params)?;
        self.execute(plan, cancel).await
    }

    /// Run an already validated plan
    pub async fn execute(
        &self,
        plan: RunPlan,
        cancel: &CancellationToken,
    ) -> Result<RunResult, LoadTestError> {
        let started = Instant::now();
        if plan.is_empty() {
            info!("No testers requested, nothing to run");
            return Ok(RunTally::default().into_result(
                plan.scenario,
                plan.layout.layout,
                plan.rooms,
                Duration::ZERO,
                EndReason::Empty,
                0,
            ));
        }

        let clips = match self.clips {
            Some(ref clips) => clips.clone(),
            None => Arc::new(ClipLibrary::load(
                plan.clip_dir.as_deref(),
                plan.audio_bitrate_kbps,
            )?),
        };

        for room in &plan.rooms {
            self.connector
                .create_room(room)
                .await
                .map_err(|source| LoadTestError::RoomSetup {
                    room: room.clone(),
                    source,
                })?;
        }

        let video_tiles = plan.publishers.video;
        if video_tiles > plan.layout.visible_tiles {
            debug!(
                "{} video publishers per room exceed the {} tiles of layout {}",
                video_tiles, plan.layout.visible_tiles, plan.layout.layout
            );
        }
        info!(
            scenario = plan.scenario.as_deref().unwrap_or("-"),
            rooms = plan.rooms.len(),
            testers = plan.testers.len(),
            video_publishers = plan.publishers.video,
            audio_publishers = plan.publishers.audio,
            subscribers = plan.subscribers,
            layout = %plan.layout.layout,
            "Starting load test"
        );

        let run_cancel = cancel.child_token();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let (roster, speaker_task) = match plan.speakers {
            Some(speakers) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let mut simulator =
                    SpeakerSimulator::new(self.connector.clone(), speakers.interval, speakers.jitter);
                if let Some(seed) = self.speaker_seed {
                    simulator = simulator.with_seed(seed);
                }
                (
                    Some(tx),
                    Some(tokio::spawn(simulator.run(rx, run_cancel.clone()))),
                )
            }
            None => (None, None),
        };

        let ramp_task = tokio::spawn(ramp(
            plan.testers.clone(),
            plan.ramp_rate,
            self.connector.clone(),
            clips,
            run_cancel.clone(),
            events_tx,
        ));

        // A deadline the clock cannot represent is no deadline
        let deadline = if plan.duration.is_zero() {
            None
        } else {
            started.checked_add(plan.duration)
        };
        let mut tally = RunTally::default();
        let end_reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break EndReason::Cancelled,
                _ = wait_until(deadline) => break EndReason::Deadline,
                event = events_rx.recv() => match event {
                    Some(event) => {
                        observe(&event, roster.as_ref());
                        tally.record(event);
                    }
                    None => break EndReason::AllStopped,
                },
            }
        };
        info!(
            reason = end_reason.as_str(),
            live = tally.live(),
            "Load test ending, stopping testers"
        );

        run_cancel.cancel();
        if let Err(e) = ramp_task.await {
            error!("Ramp task failed: {}", e);
        }

        let drain = async {
            while let Some(event) = events_rx.recv().await {
                tally.record(event);
            }
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(
                "{} testers did not stop within {:?}",
                tally.live(),
                self.shutdown_grace
            );
        }

        let speaker_changes = match speaker_task {
            Some(task) => match task.await {
                Ok(changes) => changes,
                Err(e) => {
                    error!("Speaker task failed: {}", e);
                    0
                }
            },
            None => 0,
        };

        let result = tally.into_result(
            plan.scenario,
            plan.layout.layout,
            plan.rooms,
            started.elapsed(),
            end_reason,
            speaker_changes,
        );
        info!(
            attempted = result.attempted(),
            succeeded = result.succeeded(),
            failed = result.failed(),
            elapsed_secs = result.elapsed.as_secs_f64(),
            "Load test finished"
        );
        Ok(result)
    }
}

/// Launch testers on the ramp schedule
async fn ramp(
    specs: Vec<TesterSpec>,
    rate: f64,
    connector: Arc<dyn SessionConnector>,
    clips: Arc<ClipLibrary>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<TesterEvent>,
) -> usize {
    let mut schedule = RampSchedule::new(specs.len(), rate);
    let mut pending: Vec<Option<TesterSpec>> = specs.into_iter().map(Some).collect();

    let launched = schedule
        .drive(Instant::now(), &cancel, |entry| {
            if let Some(spec) = pending.get_mut(entry.index).and_then(Option::take) {
                tokio::spawn(run_tester(
                    spec,
                    connector.clone(),
                    clips.clone(),
                    cancel.clone(),
                    events.clone(),
                ));
            }
        })
        .await;
    debug!(launched, "Ramp finished");
    launched
}

/// Feed publisher joins and leaves to the speaker simulator
fn observe(event: &TesterEvent, roster: Option<&mpsc::UnboundedSender<RosterUpdate>>) {
    let Some(roster) = roster else {
        return;
    };
    let update = match event {
        TesterEvent::Connected {
            role: Role::Publisher | Role::Both,
            room,
            identity,
            ..
        } => RosterUpdate::Joined {
            room: room.clone(),
            identity: identity.clone(),
        },
        TesterEvent::Finished(report) if report.role != Role::Subscriber => RosterUpdate::Left {
            room: report.room.clone(),
            identity: report.identity.clone(),
        },
        _ => return,
    };
    // The simulator only stops once the run is cancelled
    let _ = roster.send(update);
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
