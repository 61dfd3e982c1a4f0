//! Fusion strategies.

use std::time::Duration;

use fuse_core::{CoreError, DesiredSetup, FusionSetup, OptimizerConfig, ScheduleEntry, StaticScheduleConfig};
use tokio::time::Instant;
use tracing::{debug, info};

/// Decides which partition the platform should run next.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// How long to wait before the next `optimize` call.
    fn sleep(&mut self) -> Duration;

    /// The partition to move to. Returning the current partition is a
    /// no-op for the mapper.
    fn optimize(&mut self, current: &FusionSetup) -> DesiredSetup;
}

/// Build the strategy selected in config, if any.
pub fn build_strategy(config: &OptimizerConfig) -> Result<Option<Box<dyn Strategy>>, CoreError> {
    match config {
        OptimizerConfig::None => Ok(None),
        OptimizerConfig::Static(schedule) => {
            Ok(Some(Box::new(StaticSchedule::from_config(schedule)?)))
        }
    }
}

/// A fixed, time-indexed list of partitions.
///
/// Entry times are measured from when the schedule was created. Once the
/// last entry has been applied the schedule either restarts after
/// `period` or polls every `idle` without proposing changes.
#[derive(Debug)]
pub struct StaticSchedule {
    entries: Vec<(Duration, DesiredSetup)>,
    next: usize,
    idle: Duration,
    period: Option<Duration>,
    /// Start of the current cycle.
    epoch: Instant,
}

impl StaticSchedule {
    pub fn new(mut entries: Vec<ScheduleEntry>, idle: Duration, period: Option<Duration>) -> Self {
        entries.sort_by_key(|e| e.at_secs);
        Self {
            entries: entries
                .into_iter()
                .map(|e| (Duration::from_secs(e.at_secs), e.groups))
                .collect(),
            next: 0,
            idle,
            period: period.filter(|p| !p.is_zero()),
            epoch: Instant::now(),
        }
    }

    pub fn from_config(config: &StaticScheduleConfig) -> Result<Self, CoreError> {
        let entries = config.entries()?;
        info!(
            entries = entries.len(),
            period_secs = ?config.period_secs,
            "Loaded static fusion schedule"
        );
        Ok(Self::new(
            entries,
            Duration::from_secs(config.idle_secs),
            config.period_secs.map(Duration::from_secs),
        ))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start the next cycle once every entry of this one has been applied.
    fn roll_over(&mut self) {
        if self.next < self.entries.len() {
            return;
        }
        if let Some(period) = self.period
            && !self.entries.is_empty()
        {
            self.epoch += period;
            self.next = 0;
            debug!("Static schedule restarting");
        }
    }
}

impl Strategy for StaticSchedule {
    fn name(&self) -> &str {
        "static"
    }

    fn sleep(&mut self) -> Duration {
        self.roll_over();
        match self.entries.get(self.next) {
            Some((at, _)) => (self.epoch + *at).saturating_duration_since(Instant::now()),
            None => self.idle,
        }
    }

    fn optimize(&mut self, current: &FusionSetup) -> DesiredSetup {
        self.roll_over();
        let elapsed = Instant::now().saturating_duration_since(self.epoch);

        // Several entries may have come due during a slow update; only the
        // latest one matters.
        let mut due = None;
        while let Some((at, groups)) = self.entries.get(self.next) {
            if *at > elapsed {
                break;
            }
            due = Some(groups.clone());
            self.next += 1;
        }

        match due {
            Some(groups) => {
                info!(entry = self.next - 1, groups = groups.groups().len(), "Applying scheduled partition");
                groups
            }
            None => current.partition(),
        }
    }
}
