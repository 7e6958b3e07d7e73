//! Speaker simulation
//!
//! Periodically picks an active speaker per room among the publishers that
//! are currently connected and announces it to the session layer.

use metrics::counter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::MAX_DURATION;
use crate::session::SessionConnector;

/// Publisher roster change reported by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterUpdate {
    Joined { room: String, identity: String },
    Left { room: String, identity: String },
}

/// Speaker candidates of one room
#[derive(Debug, Clone, Default)]
pub struct SpeakerRotation {
    candidates: Vec<String>,
    last: Option<String>,
}

impl SpeakerRotation {
    pub fn join(&mut self, identity: &str) {
        if !self.candidates.iter().any(|c| c == identity) {
            self.candidates.push(identity.to_string());
        }
    }

    pub fn leave(&mut self, identity: &str) {
        self.candidates.retain(|c| c != identity);
        if self.last.as_deref() == Some(identity) {
            self.last = None;
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Pick the next speaker uniformly among candidates other than the
    /// previous pick. A lone candidate is picked every time.
    pub fn next<R: Rng>(&mut self, rng: &mut R) -> Option<String> {
        let pool: Vec<&String> = self
            .candidates
            .iter()
            .filter(|c| self.candidates.len() == 1 || self.last.as_ref() != Some(*c))
            .collect();
        if pool.is_empty() {
            return None;
        }
        let pick = pool[rng.random_range(0..pool.len())].clone();
        self.last = Some(pick.clone());
        Some(pick)
    }
}

/// Background task that rotates speakers in every room
pub struct SpeakerSimulator {
    connector: Arc<dyn SessionConnector>,
    interval: Duration,
    jitter: f64,
    rng: StdRng,
    rooms: BTreeMap<String, SpeakerRotation>,
}

impl SpeakerSimulator {
    /// Intervals longer than [`MAX_DURATION`] are shortened to it.
    pub fn new(connector: Arc<dyn SessionConnector>, interval: Duration, jitter: f64) -> Self {
        Self {
            connector,
            interval: interval.min(MAX_DURATION),
            jitter: jitter.clamp(0.0, 1.0),
            rng: StdRng::from_os_rng(),
            rooms: BTreeMap::new(),
        }
    }

    /// Use a deterministic random sequence
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Rotate until `cancel` fires, returning the number of announced changes.
    ///
    /// Roster updates keep arriving for the whole run; once the sender is
    /// dropped the last known roster keeps rotating.
    pub async fn run(
        mut self,
        mut roster: mpsc::UnboundedReceiver<RosterUpdate>,
        cancel: CancellationToken,
    ) -> u64 {
        let mut changes = 0u64;
        let mut roster_open = true;
        let mut deadline = Instant::now() + self.next_interval();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                update = roster.recv(), if roster_open => match update {
                    Some(update) => self.apply(update),
                    None => roster_open = false,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    changes += self.rotate().await;
                    deadline = Instant::now() + self.next_interval();
                }
            }
        }

        debug!(changes, "Speaker simulation stopped");
        changes
    }

    fn apply(&mut self, update: RosterUpdate) {
        match update {
            RosterUpdate::Joined { room, identity } => {
                self.rooms.entry(room).or_default().join(&identity);
            }
            RosterUpdate::Left { room, identity } => {
                if let Some(rotation) = self.rooms.get_mut(&room) {
                    rotation.leave(&identity);
                }
            }
        }
    }

    async fn rotate(&mut self) -> u64 {
        let picks: Vec<(String, String)> = self
            .rooms
            .iter_mut()
            .filter_map(|(room, rotation)| {
                rotation
                    .next(&mut self.rng)
                    .map(|identity| (room.clone(), identity))
            })
            .collect();

        let mut announced = 0;
        for (room, identity) in picks {
            // Best effort; a missed announcement only skips one rotation
            match self.connector.announce_speaker(&room, &identity).await {
                Ok(()) => {
                    trace!(room = %room, identity = %identity, "Speaker changed");
                    counter!("loadtest_speaker_changes_total").increment(1);
                    announced += 1;
                }
                Err(e) => debug!(room = %room, "Speaker announcement failed: {}", e),
            }
        }
        announced
    }

    fn next_interval(&mut self) -> Duration {
        if self.jitter <= 0.0 {
            return self.interval;
        }
        let factor = 1.0 + self.rng.random_range(-self.jitter..=self.jitter);
        self.interval.mul_f64(factor.max(0.05))
    }
}
