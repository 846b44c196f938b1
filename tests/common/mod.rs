//! In-memory document engine with fault injection, shared by integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use stagecache::{Document, DocumentEngine, RegistryConfig, StageError, StageRegistry, StageTemplate};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MemoryState {
    files: Mutex<HashMap<PathBuf, Vec<String>>>,
    corrupt: Mutex<HashSet<PathBuf>>,
    open_delay: Mutex<Option<Duration>>,
    save_delay: Mutex<Option<Duration>>,
    fail_saves: AtomicBool,
    opens: AtomicUsize,
    saves: AtomicUsize,
    closes: AtomicUsize,
}

/// Stores each "file" as a list of lines.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<MemoryState>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, lines: &[&str]) -> Self {
        self.state.files.lock().unwrap().insert(
            PathBuf::from(path),
            lines.iter().map(|line| line.to_string()).collect(),
        );
        self
    }

    pub fn corrupt(&self, path: &str) {
        self.state.files.lock().unwrap().insert(PathBuf::from(path), Vec::new());
        self.state.corrupt.lock().unwrap().insert(PathBuf::from(path));
    }

    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.state.open_delay.lock().unwrap() = delay;
    }

    pub fn set_save_delay(&self, delay: Option<Duration>) {
        *self.state.save_delay.lock().unwrap() = delay;
    }

    pub fn fail_saves(&self, fail: bool) {
        self.state.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self, path: &str) -> Option<Vec<String>> {
        self.state.files.lock().unwrap().get(Path::new(path)).cloned()
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> usize {
        self.state.saves.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

pub struct MemoryDocument {
    path: PathBuf,
    pub lines: Vec<String>,
    state: Arc<MemoryState>,
}

#[async_trait]
impl Document for MemoryDocument {
    async fn save(&mut self) -> stagecache::Result<()> {
        let delay = *self.state.save_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_saves.load(Ordering::SeqCst) {
            return Err(StageError::io(&self.path, "disk full"));
        }
        self.state
            .files
            .lock()
            .unwrap()
            .insert(self.path.clone(), self.lines.clone());
        self.state.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentEngine for MemoryEngine {
    type Document = MemoryDocument;

    async fn open(&self, path: &Path) -> stagecache::Result<MemoryDocument> {
        let delay = *self.state.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);

        if self.state.corrupt.lock().unwrap().contains(path) {
            return Err(StageError::corrupt(path, "unparseable layer"));
        }
        let lines = self
            .state
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StageError::NotFound(path.to_path_buf()))?;
        Ok(MemoryDocument {
            path: path.to_path_buf(),
            lines,
            state: Arc::clone(&self.state),
        })
    }

    async fn create(
        &self,
        path: &Path,
        template: &StageTemplate,
    ) -> stagecache::Result<MemoryDocument> {
        let lines = vec![format!("template {:?}", template.kind)];
        self.state
            .files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), lines.clone());
        Ok(MemoryDocument {
            path: path.to_path_buf(),
            lines,
            state: Arc::clone(&self.state),
        })
    }
}

pub fn memory_registry(
    engine: &MemoryEngine,
    config: RegistryConfig,
) -> Arc<StageRegistry<MemoryEngine>> {
    StageRegistry::new(engine.clone(), config).unwrap()
}

pub fn template() -> StageTemplate {
    StageTemplate::default()
}
