//! Seam to the external geometry kernel.
//!
//! The kernel parses the IFC file, resolves relations and triangulates shapes
//! in world coordinates. Everything here is read-only from the tiler's point of
//! view. [`JsonModel`] reads a kernel export:
//!
//! ```json
//! {
//!   "schema": "IFC4",
//!   "entities": [
//!     { "id": 42, "global_id": "2O2Fr$t4X7Zf8NOew3FLOH", "class": "IfcWall",
//!       "kind": "element", "name": "Wall-001", "container": 7,
//!       "property_sets": [ { "name": "Pset_WallCommon",
//!                            "properties": [ { "name": "IsExternal", "value": true } ] } ],
//!       "representation": { "verts": [..], "faces": [..],
//!                           "materials": [ { "name": "Brick", "diffuse": [0.6, 0.3, 0.2] } ],
//!                           "material_ids": [0, 0, ..] } }
//!   ],
//!   "groups": [ { "group": "Facade", "members": [42] } ]
//! }
//! ```
//!
//! A `.zip` holding a single `.json` export is accepted as well.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, KernelError, Result};

/// Hard limit for walks along containment relations.
pub const MAX_RELATION_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Physical product (`IfcElement` and subtypes).
    #[default]
    Element,
    Space,
    Building,
    /// Other spatial structure (site, storey, ...).
    Spatial,
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntity {
    /// Express id, unique within one file.
    pub id: u64,
    pub global_id: String,
    pub class: String,
    #[serde(default)]
    pub kind: EntityKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub property_sets: Vec<PropertySet>,
    /// Spatial structure element this entity is contained in.
    #[serde(default)]
    pub container: Option<u64>,
    /// Aggregating entities (`IfcRelAggregates`), in relation order.
    #[serde(default)]
    pub decomposes: Vec<u64>,
    /// Host elements of an opening (`IfcRelVoidsElement`), in relation order.
    #[serde(default)]
    pub voids: Vec<u64>,
    #[serde(default)]
    pub representation: Option<Representation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PropertySet {
    #[serde(default = "default_pset_class")]
    pub class: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub properties: Vec<Property>,
}

fn default_pset_class() -> String {
    "IfcPropertySet".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Property {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Value,
}

/// Raw shape as exported by the kernel. `error` is set when the kernel could
/// not build the shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Representation {
    #[serde(default)]
    pub verts: Vec<f64>,
    #[serde(default)]
    pub faces: Vec<u32>,
    #[serde(default)]
    pub materials: Vec<SurfaceStyle>,
    #[serde(default)]
    pub material_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Kernel-native surface style.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SurfaceStyle {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub diffuse: Option<[f64; 3]>,
    #[serde(default)]
    pub transparency: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupAssignment {
    pub group: String,
    #[serde(default)]
    pub members: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelExport {
    #[serde(default)]
    pub schema: Option<String>,
    pub entities: Vec<SourceEntity>,
    #[serde(default)]
    pub groups: Vec<GroupAssignment>,
}

/// Triangulated shape in world coordinates.
#[derive(Debug, Clone)]
pub struct Shape {
    pub verts: Vec<[f64; 3]>,
    pub faces: Vec<[u32; 3]>,
    pub materials: Vec<SurfaceStyle>,
    /// Per-face index into `materials`, when the kernel provides one.
    pub material_ids: Option<Vec<i64>>,
}

pub trait GeometryKernel {
    fn entities(&self) -> &[SourceEntity];

    fn get(&self, id: u64) -> Option<&SourceEntity>;

    fn group_assignments(&self) -> &[GroupAssignment];

    /// `Ok(None)` when the entity has no representation.
    fn create_shape(&self, entity: &SourceEntity) -> Result<Option<Shape>, KernelError>;

    fn resolve(&self, id: u64) -> Result<&SourceEntity, KernelError> {
        self.get(id).ok_or(KernelError::DanglingReference(id))
    }

    fn by_kind(&self, kind: EntityKind) -> Vec<&SourceEntity> {
        self.entities().iter().filter(|e| e.kind == kind).collect()
    }

    fn container(&self, entity: &SourceEntity) -> Result<Option<&SourceEntity>, KernelError> {
        entity.container.map(|id| self.resolve(id)).transpose()
    }

    fn decomposes(&self, entity: &SourceEntity) -> Result<Option<&SourceEntity>, KernelError> {
        entity.decomposes.first().map(|&id| self.resolve(id)).transpose()
    }

    fn voids(&self, entity: &SourceEntity) -> Result<Option<&SourceEntity>, KernelError> {
        entity.voids.first().map(|&id| self.resolve(id)).transpose()
    }

    /// Next entity up: container, else aggregate, else opening host.
    fn parent(&self, entity: &SourceEntity) -> Result<Option<&SourceEntity>, KernelError> {
        if let Some(container) = self.container(entity)? {
            return Ok(Some(container));
        }
        if let Some(whole) = self.decomposes(entity)? {
            return Ok(Some(whole));
        }
        self.voids(entity)
    }

    /// Every entity whose parent chain reaches `root`, in model order.
    fn decomposition(&self, root: &SourceEntity) -> Vec<&SourceEntity> {
        self.entities()
            .iter()
            .filter(|e| e.id != root.id && reaches(self, e, root.id))
            .collect()
    }
}

fn reaches<K: GeometryKernel + ?Sized>(kernel: &K, entity: &SourceEntity, target: u64) -> bool {
    let mut current = entity;
    for _ in 0..MAX_RELATION_DEPTH {
        match kernel.parent(current) {
            Ok(Some(parent)) if parent.id == target => return true,
            Ok(Some(parent)) => current = parent,
            _ => return false,
        }
    }
    false
}

/// Kernel export loaded from JSON.
#[derive(Debug, Clone)]
pub struct JsonModel {
    export: ModelExport,
    index: HashMap<u64, usize>,
}

impl JsonModel {
    pub fn from_export(export: ModelExport) -> Self {
        let index = export
            .entities
            .iter()
            .enumerate()
            .map(|(position, entity)| (entity.id, position))
            .collect();
        Self { export, index }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_export(serde_json::from_slice(bytes)?))
    }

    pub fn schema(&self) -> Option<&str> {
        self.export.schema.as_deref()
    }

    /// Load a `.json` export or a `.zip` containing one.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let is_zip = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);

        if is_zip {
            let file = File::open(path).map_err(|e| Error::model(path, e))?;
            let mut archive = zip::ZipArchive::new(file).map_err(|e| Error::model(path, e))?;

            let json_name = archive
                .file_names()
                .find(|n| n.to_ascii_lowercase().ends_with(".json"))
                .ok_or_else(|| Error::model(path, "no .json export found in zip archive"))?
                .to_owned();

            let entry = archive
                .by_name(&json_name)
                .map_err(|e| Error::model(path, e))?;
            let export: ModelExport =
                serde_json::from_reader(std::io::BufReader::new(entry))
                    .map_err(|e| Error::model(path, e))?;

            return Ok(Self::from_export(export));
        }

        read_export(path)
    }
}

#[cfg(feature = "mmap")]
fn read_export(path: &Path) -> Result<JsonModel> {
    let file = File::open(path).map_err(|e| Error::model(path, e))?;
    // Safety: the export is opened read-only and not expected to change while mapped.
    let map = unsafe { memmap2::MmapOptions::new().map(&file) }.map_err(|e| Error::model(path, e))?;
    JsonModel::from_slice(&map).map_err(|e| Error::model(path, e))
}

#[cfg(not(feature = "mmap"))]
fn read_export(path: &Path) -> Result<JsonModel> {
    let bytes = std::fs::read(path).map_err(|e| Error::model(path, e))?;
    JsonModel::from_slice(&bytes).map_err(|e| Error::model(path, e))
}

impl GeometryKernel for JsonModel {
    fn entities(&self) -> &[SourceEntity] {
        &self.export.entities
    }

    fn get(&self, id: u64) -> Option<&SourceEntity> {
        self.index.get(&id).map(|&i| &self.export.entities[i])
    }

    fn group_assignments(&self) -> &[GroupAssignment] {
        &self.export.groups
    }

    fn create_shape(&self, entity: &SourceEntity) -> Result<Option<Shape>, KernelError> {
        let Some(rep) = entity.representation.as_ref() else {
            return Ok(None);
        };

        if let Some(err) = rep.error.as_ref() {
            return Err(KernelError::Shape(err.clone()));
        }
        if rep.verts.len() % 3 != 0 {
            return Err(KernelError::Shape(format!(
                "vertex buffer length {} is not a multiple of 3",
                rep.verts.len()
            )));
        }
        if rep.faces.len() % 3 != 0 {
            return Err(KernelError::Shape(format!(
                "face buffer length {} is not a multiple of 3",
                rep.faces.len()
            )));
        }

        let verts: Vec<[f64; 3]> = rep
            .verts
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();

        let faces: Vec<[u32; 3]> = rep
            .faces
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();

        if let Some(bad) = faces.iter().flatten().find(|&&i| i as usize >= verts.len()) {
            return Err(KernelError::Shape(format!(
                "face references vertex {} of {}",
                bad,
                verts.len()
            )));
        }

        Ok(Some(Shape {
            verts,
            faces,
            materials: rep.materials.clone(),
            material_ids: rep.material_ids.clone(),
        }))
    }
}
