use super::{StageTemplate, TemplateKind, UpAxis};
use crate::core::{Result, StageError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SCENE_FORMAT_VERSION: u32 = 1;

/// A typed node of the scene hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prim {
    pub type_name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

fn default_active() -> bool {
    true
}

impl Prim {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            active: true,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}

/// Serialized form of a stage: the root layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneLayer {
    pub format_version: u32,
    pub up_axis: UpAxis,
    #[serde(default)]
    pub default_prim: Option<String>,
    #[serde(default)]
    pub prims: BTreeMap<String, Prim>,
}

impl SceneLayer {
    pub fn empty(up_axis: UpAxis) -> Self {
        Self {
            format_version: SCENE_FORMAT_VERSION,
            up_axis,
            default_prim: None,
            prims: BTreeMap::new(),
        }
    }

    /// Builds the initial layer for a newly created stage.
    pub fn from_template(template: &StageTemplate) -> Self {
        let mut layer = Self::empty(template.up_axis);
        match template.kind {
            TemplateKind::Empty => {
                layer.prims.insert("/root".to_string(), Prim::new("Xform"));
                layer.default_prim = Some("/root".to_string());
            }
            TemplateKind::Basic => {
                layer.insert_world();
                layer.prims.insert(
                    "/World/Camera".to_string(),
                    Prim::new("Camera")
                        .with_attribute("focalLength", json!(24.0))
                        .with_attribute("clippingRange", json!([0.01, 10000.0]))
                        .with_attribute("focusDistance", json!(5.0)),
                );
                layer
                    .prims
                    .insert("/World/Light".to_string(), Prim::new("Xform"));
                layer
                    .prims
                    .insert("/World/GroundPlane".to_string(), ground_plane());
            }
            TemplateKind::Physics => {
                layer.insert_world();
                layer.prims.insert(
                    "/World/PhysicsScene".to_string(),
                    Prim::new("PhysicsScene")
                        .with_attribute("gravityDirection", json!([0.0, -1.0, 0.0]))
                        .with_attribute("gravityMagnitude", json!(9.81)),
                );
                layer.prims.insert(
                    "/World/GroundPlane".to_string(),
                    ground_plane()
                        .with_attribute("physics:collisionEnabled", json!(true))
                        .with_attribute("physics:approximation", json!("plane")),
                );
            }
        }
        layer
    }

    fn insert_world(&mut self) {
        self.prims.insert("/World".to_string(), Prim::new("Xform"));
        self.default_prim = Some("/World".to_string());
    }
}

fn ground_plane() -> Prim {
    Prim::new("Mesh")
        .with_attribute(
            "points",
            json!([[-50, 0, -50], [50, 0, -50], [50, 0, 50], [-50, 0, 50]]),
        )
        .with_attribute("faceVertexCounts", json!([4]))
        .with_attribute("faceVertexIndices", json!([0, 1, 2, 3]))
        .with_attribute(
            "normals",
            json!([[0, 1, 0], [0, 1, 0], [0, 1, 0], [0, 1, 0]]),
        )
        .with_attribute("extent", json!([[-50, 0, -50], [50, 0, 50]]))
}

/// Checks that `path` is an absolute prim path such as `/World/Camera`.
pub fn validate_prim_path(path: &str) -> Result<()> {
    let valid = path.len() > 1
        && path.starts_with('/')
        && path[1..].split('/').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        });
    if valid {
        Ok(())
    } else {
        Err(StageError::Document(format!("invalid prim path '{}'", path)))
    }
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((parent, _)) => Some(parent),
    }
}

/// A stage document backed by a single JSON layer on disk.
#[derive(Debug)]
pub struct SceneDocument {
    path: PathBuf,
    layer: SceneLayer,
}

impl SceneDocument {
    pub fn new(path: impl Into<PathBuf>, layer: SceneLayer) -> Self {
        Self {
            path: path.into(),
            layer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layer(&self) -> &SceneLayer {
        &self.layer
    }

    pub fn up_axis(&self) -> UpAxis {
        self.layer.up_axis
    }

    pub fn set_up_axis(&mut self, up_axis: UpAxis) {
        self.layer.up_axis = up_axis;
    }

    pub fn default_prim(&self) -> Option<&str> {
        self.layer.default_prim.as_deref()
    }

    pub fn set_default_prim(&mut self, path: &str) -> Result<()> {
        if !self.layer.prims.contains_key(path) {
            return Err(StageError::Document(format!("prim '{}' does not exist", path)));
        }
        self.layer.default_prim = Some(path.to_string());
        Ok(())
    }

    pub fn prim(&self, path: &str) -> Option<&Prim> {
        self.layer.prims.get(path)
    }

    /// Defines (or retypes) the prim at `path`.
    ///
    /// Missing ancestors are defined as `Xform`.
    pub fn define_prim(&mut self, path: &str, type_name: &str) -> Result<&mut Prim> {
        validate_prim_path(path)?;

        let mut ancestor = parent_of(path);
        while let Some(parent) = ancestor {
            self.layer
                .prims
                .entry(parent.to_string())
                .or_insert_with(|| Prim::new("Xform"));
            ancestor = parent_of(parent);
        }

        let prim = self
            .layer
            .prims
            .entry(path.to_string())
            .or_insert_with(|| Prim::new(type_name));
        prim.type_name = type_name.to_string();
        Ok(prim)
    }

    /// Removes the prim at `path` and all of its descendants.
    ///
    /// Returns the number of prims removed.
    pub fn remove_prim(&mut self, path: &str) -> Result<usize> {
        validate_prim_path(path)?;
        let prefix = format!("{}/", path);
        let before = self.layer.prims.len();
        self.layer
            .prims
            .retain(|candidate, _| candidate != path && !candidate.starts_with(&prefix));
        let removed = before - self.layer.prims.len();
        if removed == 0 {
            return Err(StageError::Document(format!("prim '{}' does not exist", path)));
        }
        if self
            .layer
            .default_prim
            .as_deref()
            .is_some_and(|default| !self.layer.prims.contains_key(default))
        {
            self.layer.default_prim = None;
        }
        Ok(removed)
    }

    pub fn set_attribute(&mut self, path: &str, name: &str, value: Value) -> Result<()> {
        let prim = self
            .layer
            .prims
            .get_mut(path)
            .ok_or_else(|| StageError::Document(format!("prim '{}' does not exist", path)))?;
        prim.attributes.insert(name.to_string(), value);
        Ok(())
    }

    pub fn attribute(&self, path: &str, name: &str) -> Option<&Value> {
        self.layer.prims.get(path)?.attributes.get(name)
    }

    /// Lists `under` and every prim below it, in path order.
    pub fn list_prims(&self, under: &str) -> Vec<(&str, &Prim)> {
        let prefix = if under == "/" {
            "/".to_string()
        } else {
            format!("{}/", under)
        };
        self.layer
            .prims
            .iter()
            .filter(|(path, _)| path.as_str() == under || path.starts_with(&prefix))
            .map(|(path, prim)| (path.as_str(), prim))
            .collect()
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(&self.layer).map_err(|err| StageError::io(&self.path, err))
    }

    pub(crate) fn from_bytes(path: &Path, bytes: &[u8]) -> Result<Self> {
        let layer: SceneLayer =
            serde_json::from_slice(bytes).map_err(|err| StageError::corrupt(path, err))?;
        if layer.format_version != SCENE_FORMAT_VERSION {
            return Err(StageError::corrupt(
                path,
                format!("unsupported scene format version {}", layer.format_version),
            ));
        }
        Ok(Self::new(path, layer))
    }
}
