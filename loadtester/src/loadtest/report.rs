//! Run results
//!
//! Tester events are folded into a [`RunTally`] by the orchestrator's event
//! loop, which is the only writer. The tally becomes a [`RunResult`] once the
//! run ends.

use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

use super::layout::Layout;
use super::tester::{Role, TesterEvent, TesterReport};

/// Tester outcomes for one role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleStats {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Launched but cancelled before the connection completed
    pub cancelled: usize,
}

impl RoleStats {
    fn merge(&mut self, other: &RoleStats) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The configured duration elapsed
    Deadline,
    /// Cancelled from outside
    Cancelled,
    /// Every tester stopped on its own
    AllStopped,
    /// Nothing was requested
    Empty,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Deadline => "deadline",
            EndReason::Cancelled => "cancelled",
            EndReason::AllStopped => "all testers stopped",
            EndReason::Empty => "empty",
        }
    }
}

/// Summary of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub scenario: Option<String>,
    pub layout: Layout,
    pub rooms: Vec<String>,
    /// Testers that publish, including those that also subscribe
    pub publishers: RoleStats,
    pub subscribers: RoleStats,
    #[serde(rename = "elapsed_secs", serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub end_reason: EndReason,
    pub tracks_published: u64,
    pub samples_sent: u64,
    pub bytes_sent: u64,
    pub tracks_subscribed: u64,
    pub bytes_received: u64,
    /// Speaker changes announced by the simulator
    pub speaker_changes: u64,
    pub testers: Vec<TesterReport>,
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl RunResult {
    pub fn totals(&self) -> RoleStats {
        let mut totals = self.publishers;
        totals.merge(&self.subscribers);
        totals
    }

    pub fn attempted(&self) -> usize {
        self.totals().attempted
    }

    pub fn succeeded(&self) -> usize {
        self.totals().succeeded
    }

    pub fn failed(&self) -> usize {
        self.totals().failed
    }
}

fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / 1_000_000.0
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scenario {
            Some(ref scenario) => writeln!(f, "=== Load Test Summary: {} ===", scenario)?,
            None => writeln!(f, "=== Load Test Summary ===")?,
        }
        writeln!(
            f,
            "Rooms: {} ({}), layout {}",
            self.rooms.len(),
            self.rooms.join(", "),
            self.layout
        )?;
        writeln!(
            f,
            "Elapsed: {:.1}s, ended by {}",
            self.elapsed.as_secs_f64(),
            self.end_reason.as_str()
        )?;
        writeln!(
            f,
            "{:<12} {:>9} {:>9} {:>7} {:>9}",
            "Role", "Attempted", "Succeeded", "Failed", "Cancelled"
        )?;
        for (label, stats) in [
            ("publishers", &self.publishers),
            ("subscribers", &self.subscribers),
        ] {
            writeln!(
                f,
                "{:<12} {:>9} {:>9} {:>7} {:>9}",
                label, stats.attempted, stats.succeeded, stats.failed, stats.cancelled
            )?;
        }
        writeln!(f, "Tracks published: {}", self.tracks_published)?;
        writeln!(
            f,
            "Samples sent: {} ({:.2} MB)",
            self.samples_sent,
            megabytes(self.bytes_sent)
        )?;
        writeln!(
            f,
            "Tracks subscribed: {}, received {:.2} MB",
            self.tracks_subscribed,
            megabytes(self.bytes_received)
        )?;
        write!(f, "Speaker changes: {}", self.speaker_changes)
    }
}

/// Running aggregate of tester events
#[derive(Debug, Default)]
pub struct RunTally {
    publishers: RoleStats,
    subscribers: RoleStats,
    reports: Vec<TesterReport>,
    live: usize,
}

impl RunTally {
    fn stats_mut(&mut self, role: Role) -> &mut RoleStats {
        match role {
            Role::Publisher | Role::Both => &mut self.publishers,
            Role::Subscriber => &mut self.subscribers,
        }
    }

    pub fn record(&mut self, event: TesterEvent) {
        match event {
            TesterEvent::Launched { role, .. } => {
                self.stats_mut(role).attempted += 1;
                self.live += 1;
            }
            TesterEvent::Connected { role, .. } => self.stats_mut(role).succeeded += 1,
            TesterEvent::ConnectFailed { role, .. } => self.stats_mut(role).failed += 1,
            TesterEvent::Cancelled { role, .. } => self.stats_mut(role).cancelled += 1,
            // Counted as started when it connected; it no longer is
            TesterEvent::Failed { role, .. } => {
                let stats = self.stats_mut(role);
                stats.succeeded = stats.succeeded.saturating_sub(1);
                stats.failed += 1;
            }
            TesterEvent::Finished(report) => {
                self.live = self.live.saturating_sub(1);
                self.reports.push(report);
            }
        }
    }

    /// Testers launched that have not reported back yet
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn attempted(&self) -> usize {
        self.publishers.attempted + self.subscribers.attempted
    }

    pub fn into_result(
        mut self,
        scenario: Option<String>,
        layout: Layout,
        rooms: Vec<String>,
        elapsed: Duration,
        end_reason: EndReason,
        speaker_changes: u64,
    ) -> RunResult {
        self.reports.sort_by_key(|r| r.index);
        let sum = |f: fn(&TesterReport) -> u64| self.reports.iter().map(f).sum::<u64>();

        RunResult {
            scenario,
            layout,
            rooms,
            publishers: self.publishers,
            subscribers: self.subscribers,
            elapsed,
            end_reason,
            tracks_published: sum(|r| r.tracks_published as u64),
            samples_sent: sum(|r| r.samples_sent),
            bytes_sent: sum(|r| r.bytes_sent),
            tracks_subscribed: sum(|r| r.tracks_subscribed),
            bytes_received: sum(|r| r.bytes_received),
            speaker_changes,
            testers: self.reports,
        }
    }
}
