// ============================================================================
// stagecache Library
// ============================================================================

//! Thread-safe, handle-based registry for scene-description stages.
//!
//! Opening a stage is expensive, so the registry keeps opened documents
//! resident, hands out opaque [`StageHandle`]s, reference-counts them and
//! reclaims unreferenced stages through LRU capacity eviction and a periodic
//! idle-TTL sweep.
//!
//! ```no_run
//! use stagecache::{FsSceneEngine, RegistryConfig, StageRegistry, StageTemplate};
//!
//! # async fn demo() -> stagecache::Result<()> {
//! let registry = StageRegistry::start(FsSceneEngine::new(), RegistryConfig::default())?;
//!
//! let handle = registry.open("/tmp/scene.usd", true, &StageTemplate::default()).await?;
//! registry
//!     .with_mutation(handle, |stage| stage.define_prim("/root/Ball", "Sphere").map(|_| ()))
//!     .await?;
//! registry.close(handle, true).await?;
//!
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod engine;
pub mod prelude;
pub mod registry;

// Re-export main types for convenience
pub use core::{EntryState, Result, StageError, StageHandle};
pub use engine::{
    Document, DocumentEngine, FsSceneEngine, Prim, SceneDocument, StageTemplate, TemplateKind,
    UpAxis,
};
pub use registry::{
    DirtyEvictionPolicy, MaintenanceReport, RegistryConfig, RegistryStatus, ShutdownReport,
    StageInfo, StageRegistry,
};
