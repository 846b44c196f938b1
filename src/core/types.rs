use super::StageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier of a resident stage.
///
/// Handles come from a monotonic counter and are never reassigned, so a handle
/// kept after its stage was closed keeps failing with `InvalidHandle` instead
/// of silently addressing a newer stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageHandle(u64);

impl StageHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage-{}", self.0)
    }
}

impl FromStr for StageHandle {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("stage-")
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(StageHandle)
            .ok_or_else(|| StageError::Config(format!("malformed stage handle '{}'", s)))
    }
}

/// Issues process-unique stage handles.
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> StageHandle {
        StageHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a registry entry.
///
/// `Opening` never appears in the table: entries are built off-table and
/// inserted already `Resident`. `Closed` entries are gone from the table, so
/// both states are only observable through logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Opening,
    Resident,
    Evicting,
    Closing,
    Closed,
}

impl EntryState {
    pub fn is_resident(&self) -> bool {
        matches!(self, EntryState::Resident)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryState::Opening => "opening",
            EntryState::Resident => "resident",
            EntryState::Evicting => "evicting",
            EntryState::Closing => "closing",
            EntryState::Closed => "closed",
        };
        f.write_str(name)
    }
}
