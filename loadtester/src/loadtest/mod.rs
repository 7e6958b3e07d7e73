//! Load generation
//!
//! Planning, ramp-up, testers, speaker simulation and the orchestrator that
//! ties them together.

pub mod layout;
pub mod orchestrator;
pub mod plan;
pub mod ramp;
pub mod report;
pub mod speaker;
pub mod suite;
pub mod tester;

pub use layout::{Layout, LayoutPlan};
pub use orchestrator::{LoadTest, LoadTestError};
pub use plan::{RunPlan, SpeakerPlan};
pub use ramp::{RampEntry, RampSchedule};
pub use report::{EndReason, RoleStats, RunResult};
pub use speaker::{RosterUpdate, SpeakerRotation, SpeakerSimulator};
pub use suite::{SUITE, Scenario, run_scenarios, run_suite};
pub use tester::{Role, Tester, TesterError, TesterReport, TesterSpec, TesterState};
