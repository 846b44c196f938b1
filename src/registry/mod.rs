//! Handle-based stage registry.
//!
//! Two lock tiers guard the registry:
//! - the structural lock (`table`) covers the handle/path maps, reference
//!   counts, pins and entry states. It is a plain mutex held only for map
//!   bookkeeping and never across an `.await`;
//! - each entry's content lock covers its document and dirty flag. Save and
//!   teardown I/O run under this lock alone, so one slow stage never blocks
//!   the others.
//!
//! Opening and tearing down the same canonical path are additionally
//! serialized by a per-path gate, which keeps a re-open from reading a file
//! that a closing entry is still writing.

pub mod config;
mod lru;
pub mod maintenance;
pub mod status;
mod table;

pub use config::{DirtyEvictionPolicy, RegistryConfig};
pub use maintenance::MaintenanceWorker;
pub use status::{MaintenanceReport, RegistryStatus, ShutdownReport, StageInfo};

use self::lru::LruTracker;
use self::table::{PathGate, PathGateGuard, StageEntry, StageTable};
use crate::core::{EntryState, HandleAllocator, Result, StageError, StageHandle};
use crate::engine::{Document, DocumentEngine, StageTemplate};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{Level, event};

/// Thread-safe cache of open stages.
///
/// Feature modules `open` a path to obtain a handle, touch the document only
/// inside `with_read` / `with_mutation`, and `close` the handle when done.
/// Create one registry per process with [`StageRegistry::start`] and tear it
/// down with [`StageRegistry::shutdown`].
pub struct StageRegistry<E: DocumentEngine> {
    engine: E,
    config: RegistryConfig,
    handles: HandleAllocator,
    table: Mutex<StageTable<E::Document>>,
    lru: LruTracker,
    evictions: AtomicU64,
    overcommits: AtomicU64,
    closed: AtomicBool,
    worker: Mutex<Option<MaintenanceWorker>>,
}

/// Result of trying to evict one entry.
enum Eviction {
    Evicted,
    Refused,
    /// The entry was referenced, pinned or already gone by the time we looked.
    Skipped,
}

impl<E: DocumentEngine> StageRegistry<E> {
    /// Create a registry without background maintenance.
    pub fn new(engine: E, config: RegistryConfig) -> Result<Arc<Self>> {
        config.validate()?;

        Ok(Arc::new(Self {
            engine,
            config,
            handles: HandleAllocator::new(),
            table: Mutex::new(StageTable::new()),
            lru: LruTracker::new(),
            evictions: AtomicU64::new(0),
            overcommits: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            worker: Mutex::new(None),
        }))
    }

    /// Create a registry and spawn its maintenance task on the current runtime.
    pub fn start(engine: E, config: RegistryConfig) -> Result<Arc<Self>> {
        let registry = Self::new(engine, config)?;
        registry.start_maintenance()?;
        Ok(registry)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Spawn the periodic maintenance task. The task holds only a weak
    /// reference and stops on `shutdown` or when the registry is dropped.
    pub fn start_maintenance(self: &Arc<Self>) -> Result<()> {
        self.ensure_open()?;
        let mut worker = self.worker.lock()?;
        if worker.as_ref().is_some_and(|running| !running.is_finished()) {
            return Ok(());
        }

        let registry = Arc::downgrade(self);
        *worker = Some(MaintenanceWorker::spawn(
            self.config.maintenance_interval,
            move || {
                let registry = registry.clone();
                async move {
                    match registry.upgrade() {
                        Some(registry) => registry.maintenance_tick().await,
                        None => false,
                    }
                }
            },
        ));
        event!(
            Level::INFO,
            interval = ?self.config.maintenance_interval,
            idle_ttl = ?self.config.idle_ttl,
            "stage maintenance started"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Open / close
    // ------------------------------------------------------------------

    /// Open the stage at `path`, creating it from `template` when it does not
    /// exist and `create_if_missing` is set.
    ///
    /// Opening a path that is already resident returns the existing handle
    /// and adds a reference.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use stagecache::{FsSceneEngine, RegistryConfig, StageRegistry, StageTemplate, TemplateKind};
    ///
    /// # tokio_test::block_on(async {
    /// let registry = StageRegistry::new(FsSceneEngine::new(), RegistryConfig::default()).unwrap();
    /// let template = StageTemplate::new(TemplateKind::Basic);
    /// let first = registry.open("/tmp/shot_010.usd", true, &template).await.unwrap();
    /// let second = registry.open("/tmp/shot_010.usd", false, &template).await.unwrap();
    /// assert_eq!(first, second);
    /// # });
    /// ```
    pub async fn open(
        &self,
        path: impl AsRef<Path>,
        create_if_missing: bool,
        template: &StageTemplate,
    ) -> Result<StageHandle> {
        self.ensure_open()?;
        let path = normalize_path(path.as_ref())?;

        let limit = self.config.open_timeout;
        let (handle, inserted) = timeout(limit, self.open_inner(&path, create_if_missing, template))
            .await
            .map_err(|_| {
                event!(Level::WARN, path = %path.display(), timeout = ?limit, "stage open timed out");
                StageError::Timeout {
                    operation: "open",
                    after: limit,
                }
            })??;

        if inserted {
            event!(Level::INFO, handle = %handle, path = %path.display(), "stage opened");
            if let Err(err) = self.enforce_capacity().await {
                event!(Level::ERROR, error = %err, "capacity enforcement failed");
            }
        } else {
            event!(Level::DEBUG, handle = %handle, path = %path.display(), "stage cache hit");
        }
        Ok(handle)
    }

    async fn open_inner(
        &self,
        path: &Path,
        create_if_missing: bool,
        template: &StageTemplate,
    ) -> Result<(StageHandle, bool)> {
        loop {
            let mut claim = {
                let mut table = self.table()?;
                if let Some(handle) = self.reference_existing(&mut table, path)? {
                    return Ok((handle, false));
                }
                GateClaim {
                    table: &self.table,
                    path,
                    gate: table.gate_for(path),
                    guard: None,
                }
            };
            claim.guard = Some(Arc::clone(&claim.gate).lock_owned().await);
            let gate = &claim.gate;

            {
                let mut table = self.table()?;
                if let Some(handle) = self.reference_existing(&mut table, path)? {
                    return Ok((handle, false));
                }
                if !table.owns_gate(path, gate) {
                    // A teardown replaced the gate while we waited.
                    continue;
                }
            }

            let loaded = self.load_document(path, create_if_missing, template).await;

            let mut table = self.table()?;
            table.release_gate(path, gate);
            let document = loaded?;
            if self.is_shut_down() {
                drop(table);
                document.close();
                return Err(StageError::RegistryClosed);
            }
            let handle = self.handles.allocate();
            table.insert(
                Arc::new(StageEntry::new(handle, path.to_path_buf(), document)),
                1,
            );
            self.lru.insert(handle);
            return Ok((handle, true));
        }
    }

    fn reference_existing(
        &self,
        table: &mut StageTable<E::Document>,
        path: &Path,
    ) -> Result<Option<StageHandle>> {
        let Some(handle) = table.resident_handle_for(path) else {
            return Ok(None);
        };
        table.resident_mut(handle)?.refs += 1;
        self.lru.touch(handle);
        Ok(Some(handle))
    }

    async fn load_document(
        &self,
        path: &Path,
        create_if_missing: bool,
        template: &StageTemplate,
    ) -> Result<E::Document> {
        match self.engine.open(path).await {
            Err(StageError::NotFound(_)) if create_if_missing => {
                self.engine.create(path, template).await
            }
            other => other,
        }
    }

    /// Drop one reference to `handle`.
    ///
    /// When the last reference goes, the stage is saved (if requested and
    /// dirty), removed and its document released before this returns. If that
    /// save fails the close is refused: the caller keeps its reference and
    /// gets the error back.
    pub async fn close(&self, handle: StageHandle, save_if_dirty: bool) -> Result<()> {
        self.ensure_open()?;

        let (entry, previous_refs, gate, guard) = {
            let mut table = self.table()?;
            let slot = table.resident_mut(handle)?;
            if slot.refs > 1 {
                slot.refs -= 1;
                event!(Level::DEBUG, handle = %handle, refs = slot.refs, "stage reference dropped");
                return Ok(());
            }
            let previous_refs = slot.refs;
            let entry = Arc::clone(&slot.entry);
            let (gate, guard) = table.install_gate(&entry.path)?;
            let slot = table.resident_mut(handle)?;
            slot.refs = 0;
            slot.state = EntryState::Closing;
            (entry, previous_refs, gate, guard)
        };

        match self.teardown(&entry, save_if_dirty).await {
            Ok(()) => {
                self.finish_removal(&entry, &gate, guard)?;
                event!(Level::INFO, handle = %handle, path = %entry.path.display(), "stage closed");
                Ok(())
            }
            Err(err) => {
                {
                    let mut table = self.table()?;
                    if let Some(slot) = table.get_mut(handle) {
                        slot.state = EntryState::Resident;
                        slot.refs = previous_refs;
                    }
                    table.release_gate(&entry.path, &gate);
                }
                drop(guard);
                event!(Level::ERROR, handle = %handle, error = %err, "stage close refused, save failed");
                Err(err)
            }
        }
    }

    /// Drop one reference but keep the stage resident for later re-opens.
    /// Unreferenced stages are reclaimed by capacity eviction and maintenance.
    pub async fn release(&self, handle: StageHandle) -> Result<()> {
        self.ensure_open()?;
        {
            let mut table = self.table()?;
            let slot = table.resident_mut(handle)?;
            if slot.refs == 0 {
                return Err(StageError::InvalidHandle(handle));
            }
            slot.refs -= 1;
        }
        if let Err(err) = self.enforce_capacity().await {
            event!(Level::ERROR, error = %err, "capacity enforcement failed");
        }
        Ok(())
    }

    /// Waits for in-flight accessors, saves if asked, and releases the
    /// document. On a failed save the document stays in place.
    async fn teardown(&self, entry: &StageEntry<E::Document>, save_if_dirty: bool) -> Result<()> {
        let mut content = entry.content.write().await;
        if save_if_dirty && entry.is_dirty() {
            if let Some(document) = content.as_mut() {
                self.persist(document, &entry.path).await?;
                entry.clear_dirty();
            }
        }
        if let Some(document) = content.take() {
            document.close();
        }
        Ok(())
    }

    fn finish_removal(
        &self,
        entry: &StageEntry<E::Document>,
        gate: &PathGate,
        guard: PathGateGuard,
    ) -> Result<()> {
        {
            let mut table = self.table()?;
            table.remove(entry.handle);
            table.release_gate(&entry.path, gate);
        }
        self.lru.remove(entry.handle);
        drop(guard);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Run `f` with shared access to the stage's document.
    pub async fn with_read<T, F>(&self, handle: StageHandle, f: F) -> Result<T>
    where
        F: FnOnce(&E::Document) -> T,
    {
        let pin = self.pin(handle)?;
        let content = pin.entry.content.read().await;
        let document = content.as_ref().ok_or(StageError::InvalidHandle(handle))?;
        Ok(f(document))
    }

    /// Run `f` with exclusive access to the stage's document. The stage is
    /// marked dirty when `f` succeeds.
    pub async fn with_mutation<T, F>(&self, handle: StageHandle, f: F) -> Result<T>
    where
        F: FnOnce(&mut E::Document) -> Result<T>,
    {
        let pin = self.pin(handle)?;
        let mut content = pin.entry.content.write().await;
        let document = content.as_mut().ok_or(StageError::InvalidHandle(handle))?;
        let value = f(document)?;
        pin.entry.mark_dirty();
        Ok(value)
    }

    /// Persist the stage if it has unsaved mutations. A failed save keeps the
    /// dirty flag so the call can be retried.
    pub async fn save(&self, handle: StageHandle) -> Result<()> {
        let pin = self.pin(handle)?;
        let mut content = pin.entry.content.write().await;
        let document = content.as_mut().ok_or(StageError::InvalidHandle(handle))?;
        if !pin.entry.is_dirty() {
            return Ok(());
        }
        self.persist(document, &pin.entry.path).await?;
        pin.entry.clear_dirty();
        event!(Level::DEBUG, handle = %handle, path = %pin.entry.path.display(), "stage saved");
        Ok(())
    }

    async fn persist(&self, document: &mut E::Document, path: &Path) -> Result<()> {
        let result = match self.config.save_timeout {
            Some(limit) => timeout(limit, document.save())
                .await
                .unwrap_or(Err(StageError::Timeout {
                    operation: "save",
                    after: limit,
                })),
            None => document.save().await,
        };
        if let Err(err) = &result {
            event!(Level::ERROR, path = %path.display(), error = %err, "stage save failed");
        }
        result
    }

    fn pin(&self, handle: StageHandle) -> Result<AccessPin<'_, E::Document>> {
        self.ensure_open()?;
        let entry = {
            let mut table = self.table()?;
            let slot = table.resident_mut(handle)?;
            slot.pins += 1;
            Arc::clone(&slot.entry)
        };
        self.lru.touch(handle);
        Ok(AccessPin {
            table: &self.table,
            entry,
        })
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Evict least recently used, unreferenced stages until the resident
    /// count is within capacity. Overcommits when nothing is evictable.
    async fn enforce_capacity(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        let mut refused = HashSet::new();

        loop {
            let candidate = {
                let table = self.table()?;
                if table.len() <= self.config.max_resident_stages {
                    break;
                }
                let candidate = self
                    .lru
                    .least_recent_first()
                    .into_iter()
                    .map(|(handle, _)| handle)
                    .find(|handle| !refused.contains(handle) && self.is_candidate(&table, *handle));
                if candidate.is_none() {
                    let overcommit = StageError::CapacityExceeded {
                        resident: table.len(),
                        capacity: self.config.max_resident_stages,
                    };
                    self.overcommits.fetch_add(1, Ordering::Relaxed);
                    report.overcommitted = true;
                    event!(Level::WARN, error = %overcommit, "no evictable stage, overcommitting");
                }
                candidate
            };

            let Some(handle) = candidate else {
                break;
            };
            match self.evict(handle).await? {
                Eviction::Evicted => report.evicted += 1,
                Eviction::Refused => {
                    report.refused += 1;
                    refused.insert(handle);
                }
                Eviction::Skipped => {
                    refused.insert(handle);
                }
            }
        }
        Ok(report)
    }

    fn is_candidate(&self, table: &StageTable<E::Document>, handle: StageHandle) -> bool {
        table.get(handle).is_some_and(|slot| {
            slot.is_evictable()
                && !(self.config.dirty_eviction == DirtyEvictionPolicy::Skip
                    && slot.entry.is_dirty())
        })
    }

    async fn evict(&self, handle: StageHandle) -> Result<Eviction> {
        let (entry, gate, guard) = {
            let mut table = self.table()?;
            if !self.is_candidate(&table, handle) {
                return Ok(Eviction::Skipped);
            }
            let Some(path) = table.get(handle).map(|slot| slot.entry.path.clone()) else {
                return Ok(Eviction::Skipped);
            };
            let (gate, guard) = table.install_gate(&path)?;
            let slot = table.resident_mut(handle)?;
            slot.state = EntryState::Evicting;
            (Arc::clone(&slot.entry), gate, guard)
        };

        let outcome = {
            let mut content = entry.content.write().await;
            let refused = match (entry.is_dirty(), self.config.dirty_eviction, content.as_mut()) {
                (true, DirtyEvictionPolicy::Skip, _) => true,
                (true, DirtyEvictionPolicy::SaveFirst, Some(document)) => {
                    match self.persist(document, &entry.path).await {
                        Ok(()) => {
                            entry.clear_dirty();
                            false
                        }
                        Err(_) => true,
                    }
                }
                _ => false,
            };
            if refused {
                Eviction::Refused
            } else {
                if let Some(document) = content.take() {
                    document.close();
                }
                Eviction::Evicted
            }
        };

        match outcome {
            Eviction::Evicted => {
                self.finish_removal(&entry, &gate, guard)?;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                event!(Level::INFO, handle = %handle, path = %entry.path.display(), "stage evicted");
            }
            _ => {
                {
                    let mut table = self.table()?;
                    if let Some(slot) = table.get_mut(handle) {
                        slot.state = EntryState::Resident;
                    }
                    table.release_gate(&entry.path, &gate);
                }
                drop(guard);
                event!(Level::WARN, handle = %handle, path = %entry.path.display(), "dirty stage kept resident, eviction refused");
            }
        }
        Ok(outcome)
    }

    /// Body of a background tick. Returns `false` once the registry is shut
    /// down, which ends the worker.
    async fn maintenance_tick(&self) -> bool {
        if self.is_shut_down() {
            return false;
        }
        match self.run_maintenance().await {
            Ok(_) => true,
            // Lost the race with `shutdown`.
            Err(StageError::RegistryClosed) => false,
            Err(err) => {
                event!(Level::ERROR, error = %err, "stage maintenance failed");
                !self.is_shut_down()
            }
        }
    }

    /// One maintenance pass: evict unreferenced stages idle beyond the TTL,
    /// then enforce capacity.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        self.ensure_open()?;
        let mut report = MaintenanceReport::default();

        let now = Instant::now();
        let expired: Vec<StageHandle> = {
            let table = self.table()?;
            self.lru
                .least_recent_first()
                .into_iter()
                .filter(|(handle, last_access)| {
                    now.saturating_duration_since(*last_access) >= self.config.idle_ttl
                        && self.is_candidate(&table, *handle)
                })
                .map(|(handle, _)| handle)
                .collect()
        };

        for handle in expired {
            match self.evict(handle).await? {
                Eviction::Evicted => report.evicted += 1,
                Eviction::Refused => report.refused += 1,
                Eviction::Skipped => {}
            }
        }

        report.absorb(self.enforce_capacity().await?);

        if report.evicted > 0 || report.refused > 0 {
            event!(
                Level::INFO,
                evicted = report.evicted,
                refused = report.refused,
                "stage maintenance pass"
            );
        }
        event!(Level::DEBUG, status = %self.status()?, "stage registry status");
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn status(&self) -> Result<RegistryStatus> {
        let table = self.table()?;
        let (dirty_count, referenced_count) = table.slots().fold((0, 0), |(dirty, referenced), slot| {
            (
                dirty + usize::from(slot.entry.is_dirty()),
                referenced + usize::from(slot.refs > 0),
            )
        });

        Ok(RegistryStatus {
            resident_count: table.len(),
            capacity: self.config.max_resident_stages,
            evictions_to_date: self.evictions.load(Ordering::Relaxed),
            dirty_count,
            referenced_count,
            overcommits_to_date: self.overcommits.load(Ordering::Relaxed),
        })
    }

    pub fn stage_info(&self, handle: StageHandle) -> Result<StageInfo> {
        let table = self.table()?;
        let slot = table
            .get(handle)
            .filter(|slot| slot.state.is_resident())
            .ok_or(StageError::InvalidHandle(handle))?;
        let idle_for = self
            .lru
            .last_access(handle)
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO);

        Ok(StageInfo {
            handle,
            path: slot.entry.path.clone(),
            state: slot.state,
            dirty: slot.entry.is_dirty(),
            ref_count: slot.refs,
            in_use: slot.pins > 0,
            opened_at: slot.entry.opened_at,
            idle_for,
        })
    }

    /// Handle of the resident stage for `path`, without taking a reference.
    pub fn lookup(&self, path: impl AsRef<Path>) -> Result<Option<StageHandle>> {
        let path = normalize_path(path.as_ref())?;
        Ok(self.table()?.resident_handle_for(&path))
    }

    /// All handles currently in the table, in allocation order.
    pub fn handles(&self) -> Result<Vec<StageHandle>> {
        Ok(self.table()?.handles())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop maintenance and drain every resident stage, saving dirty ones.
    ///
    /// Failed saves are logged and the stage is released anyway. Subsequent
    /// calls return an empty report; every other operation fails with
    /// `RegistryClosed`.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(ShutdownReport::default());
        }

        let worker = self.worker.lock()?.take();
        if let Some(worker) = worker {
            if let Err(err) = worker.stop().await {
                event!(Level::WARN, error = %err, "maintenance worker did not stop cleanly");
            }
        }

        let mut report = ShutdownReport::default();
        for handle in self.handles()? {
            let (entry, gate, guard) = {
                let mut table = self.table()?;
                // Slots that are not resident are already being torn down by
                // a close or an eviction.
                let Ok(slot) = table.resident_mut(handle) else {
                    continue;
                };
                let entry = Arc::clone(&slot.entry);
                let (gate, guard) = table.install_gate(&entry.path)?;
                table.resident_mut(handle)?.state = EntryState::Closing;
                (entry, gate, guard)
            };

            if let Err(err) = self.teardown(&entry, true).await {
                report.failed_saves += 1;
                event!(Level::ERROR, handle = %handle, error = %err, "stage save failed during shutdown, releasing anyway");
                if let Some(document) = entry.content.write().await.take() {
                    document.close();
                }
            }
            self.finish_removal(&entry, &gate, guard)?;
            report.closed += 1;
        }

        event!(
            Level::INFO,
            closed = report.closed,
            failed_saves = report.failed_saves,
            "stage registry shut down"
        );
        Ok(report)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(StageError::RegistryClosed)
        } else {
            Ok(())
        }
    }

    fn table(&self) -> Result<MutexGuard<'_, StageTable<E::Document>>> {
        Ok(self.table.lock()?)
    }
}

/// Keeps an entry out of eviction while an accessor runs against it.
struct AccessPin<'a, D> {
    table: &'a Mutex<StageTable<D>>,
    entry: Arc<StageEntry<D>>,
}

impl<D> Drop for AccessPin<'_, D> {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = table.get_mut(self.entry.handle) {
            slot.pins = slot.pins.saturating_sub(1);
        }
    }
}

/// A path gate registered by an open. Dropping it, including when the open
/// times out, unregisters the gate unless another opener is queued on it.
struct GateClaim<'a, D> {
    table: &'a Mutex<StageTable<D>>,
    path: &'a Path,
    gate: PathGate,
    guard: Option<PathGateGuard>,
}

impl<D> Drop for GateClaim<'_, D> {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.release_idle_gate(self.path, &self.gate);
    }
}

/// Lexically normalizes `path` into an absolute path, resolving `.` and `..`
/// without touching the file system (the file may not exist yet).
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(StageError::NotFound(path.to_path_buf()));
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|err| StageError::io(path, err))?
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}
