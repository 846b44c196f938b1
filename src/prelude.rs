//! Everything a feature module needs to work against registry stages.
//!
//! ```
//! use stagecache::prelude::*;
//!
//! async fn add_ball(registry: &StageRegistry<FsSceneEngine>, stage: StageHandle) -> Result<()> {
//!     registry
//!         .with_mutation(stage, |doc| doc.define_prim("/World/Ball", "Sphere").map(|_| ()))
//!         .await
//! }
//! ```

pub use crate::core::{Result, StageError, StageHandle};
pub use crate::engine::{
    Document, DocumentEngine, FsSceneEngine, Prim, SceneDocument, StageTemplate, TemplateKind,
    UpAxis,
};
pub use crate::registry::{RegistryConfig, StageRegistry};
