use super::scene::{SceneDocument, SceneLayer};
use super::{Document, DocumentEngine, StageTemplate};
use crate::core::{Result, StageError};
use async_trait::async_trait;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{Level, event};

/// Document engine that stores each stage as a JSON scene layer on disk.
#[derive(Debug, Clone, Default)]
pub struct FsSceneEngine;

impl FsSceneEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DocumentEngine for FsSceneEngine {
    type Document = SceneDocument;

    async fn open(&self, path: &Path) -> Result<SceneDocument> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StageError::NotFound(path.to_path_buf()));
            }
            Err(err) => return Err(StageError::io(path, err)),
        };
        SceneDocument::from_bytes(path, &bytes)
    }

    async fn create(&self, path: &Path, template: &StageTemplate) -> Result<SceneDocument> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StageError::io(parent, err))?;
        }

        let mut document = SceneDocument::new(path, SceneLayer::from_template(template));
        document.save().await?;
        event!(Level::DEBUG, path = %path.display(), template = ?template.kind, "stage created");
        Ok(document)
    }
}

#[async_trait]
impl Document for SceneDocument {
    async fn save(&mut self) -> Result<()> {
        let bytes = self.to_bytes()?;
        let path = self.path().to_path_buf();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|err| StageError::io(self.path(), format!("save task failed: {}", err)))?
    }
}

/// Writes `bytes` to a temporary file next to `path` and renames it into place,
/// so readers never observe a half-written layer.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(&dir).map_err(|err| StageError::io(&dir, err))?;
    file.write_all(bytes)
        .map_err(|err| StageError::io(path, err))?;
    file.as_file()
        .sync_all()
        .map_err(|err| StageError::io(path, err))?;
    file.persist(path)
        .map_err(|err| StageError::io(path, err.error))?;
    Ok(())
}
