use crate::core::{EntryState, Result, StageError, StageHandle};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

/// Serializes document I/O for one canonical path: an open that has to load
/// the document, and the teardown of an entry being closed or evicted.
pub(crate) type PathGate = Arc<AsyncMutex<()>>;
pub(crate) type PathGateGuard = OwnedMutexGuard<()>;

/// A resident stage. The document lives behind the content lock and is
/// `None` once the entry has been torn down.
pub(crate) struct StageEntry<D> {
    pub handle: StageHandle,
    pub path: PathBuf,
    pub opened_at: DateTime<Utc>,
    pub content: RwLock<Option<D>>,
    dirty: AtomicBool,
}

impl<D> StageEntry<D> {
    pub fn new(handle: StageHandle, path: PathBuf, document: D) -> Self {
        Self {
            handle,
            path,
            opened_at: Utc::now(),
            content: RwLock::new(Some(document)),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Only called while holding the content write lock.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Only called while holding the content write lock.
    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

/// Table bookkeeping for one entry. Mutated only under the structural lock.
pub(crate) struct Slot<D> {
    pub entry: Arc<StageEntry<D>>,
    /// Open references held by callers.
    pub refs: usize,
    /// Accessor calls currently running against the entry.
    pub pins: usize,
    pub state: EntryState,
}

impl<D> Slot<D> {
    pub fn is_evictable(&self) -> bool {
        self.state.is_resident() && self.refs == 0 && self.pins == 0
    }
}

pub(crate) struct StageTable<D> {
    slots: HashMap<StageHandle, Slot<D>>,
    by_path: HashMap<PathBuf, StageHandle>,
    gates: HashMap<PathBuf, PathGate>,
}

impl<D> StageTable<D> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            by_path: HashMap::new(),
            gates: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, handle: StageHandle) -> Option<&Slot<D>> {
        self.slots.get(&handle)
    }

    pub fn get_mut(&mut self, handle: StageHandle) -> Option<&mut Slot<D>> {
        self.slots.get_mut(&handle)
    }

    /// Looks up a slot that accepts new work.
    pub fn resident_mut(&mut self, handle: StageHandle) -> Result<&mut Slot<D>> {
        self.slots
            .get_mut(&handle)
            .filter(|slot| slot.state.is_resident())
            .ok_or(StageError::InvalidHandle(handle))
    }

    pub fn handle_for(&self, path: &Path) -> Option<StageHandle> {
        self.by_path.get(path).copied()
    }

    /// Handle of the resident entry for `path`, if it accepts new work.
    pub fn resident_handle_for(&self, path: &Path) -> Option<StageHandle> {
        self.handle_for(path)
            .filter(|handle| self.get(*handle).is_some_and(|slot| slot.state.is_resident()))
    }

    pub fn handles(&self) -> Vec<StageHandle> {
        let mut handles: Vec<_> = self.slots.keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot<D>> {
        self.slots.values()
    }

    pub fn insert(&mut self, entry: Arc<StageEntry<D>>, refs: usize) {
        self.by_path.insert(entry.path.clone(), entry.handle);
        self.slots.insert(
            entry.handle,
            Slot {
                entry,
                refs,
                pins: 0,
                state: EntryState::Resident,
            },
        );
    }

    pub fn remove(&mut self, handle: StageHandle) -> Option<Slot<D>> {
        let slot = self.slots.remove(&handle)?;
        if self.by_path.get(&slot.entry.path) == Some(&handle) {
            self.by_path.remove(&slot.entry.path);
        }
        Some(slot)
    }

    /// Returns the gate for `path`, registering a new one if none exists.
    pub fn gate_for(&mut self, path: &Path) -> PathGate {
        Arc::clone(
            self.gates
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Whether `gate` is still the registered gate for `path`.
    pub fn owns_gate(&self, path: &Path, gate: &PathGate) -> bool {
        self.gates
            .get(path)
            .is_some_and(|current| Arc::ptr_eq(current, gate))
    }

    /// Registers a fresh gate for `path` and locks it before anyone else can
    /// see it. Openers waiting on a previous gate notice the replacement and
    /// queue on this one.
    pub fn install_gate(&mut self, path: &Path) -> Result<(PathGate, PathGateGuard)> {
        let gate: PathGate = Arc::new(AsyncMutex::new(()));
        let guard = Arc::clone(&gate)
            .try_lock_owned()
            .map_err(|err| StageError::Lock(err.to_string()))?;
        self.gates.insert(path.to_path_buf(), Arc::clone(&gate));
        Ok((gate, guard))
    }

    /// Unregisters `gate` if it is still the current gate for `path`.
    pub fn release_gate(&mut self, path: &Path, gate: &PathGate) {
        if self.owns_gate(path, gate) {
            self.gates.remove(path);
        }
    }

    /// Unregisters `gate` when only the table and the caller still hold it,
    /// so an open that gave up never strands a gate other openers wait on.
    /// Gate clones are only handed out under the structural lock, which makes
    /// the count stable here.
    pub fn release_idle_gate(&mut self, path: &Path, gate: &PathGate) {
        if self.owns_gate(path, gate) && Arc::strong_count(gate) <= 2 {
            self.gates.remove(path);
        }
    }

    #[cfg(test)]
    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }
}
