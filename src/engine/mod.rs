//! Document engine contract.
//!
//! The registry never interprets stage contents. It only needs to open,
//! create, save and close documents; everything else (prims, materials,
//! physics, animation) is done by feature modules through the document
//! reference handed out by `with_read` / `with_mutation`.

pub mod fs;
pub mod scene;

pub use fs::FsSceneEngine;
pub use scene::{Prim, SceneDocument, SceneLayer};

use crate::core::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// An opened stage owned by exactly one registry entry.
#[async_trait]
pub trait Document: Send + Sync + 'static {
    /// Persist the document to its source path.
    async fn save(&mut self) -> Result<()>;

    /// Release the document. Called once, after the last save attempt.
    fn close(self)
    where
        Self: Sized,
    {
    }
}

/// Opens and creates documents on behalf of the registry.
///
/// `open` must fail with `StageError::NotFound` when the path does not exist
/// and with `StageError::Corrupt` when the contents cannot be parsed; the
/// registry relies on the former to decide whether to `create`.
#[async_trait]
pub trait DocumentEngine: Send + Sync + 'static {
    type Document: Document;

    async fn open(&self, path: &Path) -> Result<Self::Document>;

    async fn create(&self, path: &Path, template: &StageTemplate) -> Result<Self::Document>;
}

/// Scene up axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpAxis {
    #[default]
    Y,
    Z,
}

/// Initial content for a newly created stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// A single `/root` transform used as default prim.
    #[default]
    Empty,
    /// `/World` with a camera, a light and a ground plane.
    Basic,
    /// `/World` with a physics scene and a colliding ground plane.
    Physics,
}

/// Options used when `open` has to create the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageTemplate {
    pub kind: TemplateKind,
    pub up_axis: UpAxis,
}

impl StageTemplate {
    pub fn new(kind: TemplateKind) -> Self {
        Self {
            kind,
            up_axis: UpAxis::default(),
        }
    }

    pub fn up_axis(mut self, up_axis: UpAxis) -> Self {
        self.up_axis = up_axis;
        self
    }
}
