use crate::core::{EntryState, StageHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Registry snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub resident_count: usize,
    pub capacity: usize,
    pub evictions_to_date: u64,
    pub dirty_count: usize,
    pub referenced_count: usize,
    pub overcommits_to_date: u64,
}

impl std::fmt::Display for RegistryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Stage Registry: {}/{} resident, {} referenced, {} dirty, {} evicted, {} overcommits",
            self.resident_count,
            self.capacity,
            self.referenced_count,
            self.dirty_count,
            self.evictions_to_date,
            self.overcommits_to_date
        )
    }
}

/// Point-in-time view of a single stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    pub handle: StageHandle,
    pub path: PathBuf,
    pub state: EntryState,
    pub dirty: bool,
    pub ref_count: usize,
    pub in_use: bool,
    pub opened_at: DateTime<Utc>,
    pub idle_for: Duration,
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub evicted: usize,
    /// Evictions refused because a dirty stage could not or may not be saved.
    pub refused: usize,
    pub overcommitted: bool,
}

impl MaintenanceReport {
    pub(crate) fn absorb(&mut self, other: MaintenanceReport) {
        self.evicted += other.evicted;
        self.refused += other.refused;
        self.overcommitted |= other.overcommitted;
    }
}

/// Outcome of draining the registry on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub closed: usize,
    /// Stages released even though their final save failed.
    pub failed_saves: usize,
}
