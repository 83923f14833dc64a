use std::collections::HashSet;

use indexmap::IndexMap;
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, KernelError, Result};
use crate::kernel::{GeometryKernel, Shape, SourceEntity, MAX_RELATION_DEPTH};
use crate::material::Material;
use crate::NONE_LABEL;

pub type Point = [f64; 3];
pub type Triangle = [Point; 3];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min: Point,
    pub max: Point,
}

impl BoundingBox {
    pub fn from_triangles(triangles: &[Triangle]) -> Option<Self> {
        let mut points = triangles.iter().flatten();
        let first = *points.next()?;
        let mut bbox = Self {
            min: first,
            max: first,
        };
        for p in points {
            for axis in 0..3 {
                bbox.min[axis] = bbox.min[axis].min(p[axis]);
                bbox.max[axis] = bbox.max[axis].max(p[axis]);
            }
        }
        Some(bbox)
    }

    pub fn union(self, other: Self) -> Self {
        let mut out = self;
        for axis in 0..3 {
            out.min[axis] = out.min[axis].min(other.min[axis]);
            out.max[axis] = out.max[axis].max(other.max[axis]);
        }
        out
    }

    pub fn center(&self) -> Point {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
            0.5 * (self.min[2] + self.max[2]),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AncestorRef {
    pub id: String,
    pub class: String,
}

/// Triangles of one element that share a material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaterialPart {
    pub material: Material,
    pub face_indices: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertySetRow {
    pub name: String,
    pub values: Vec<(String, Value)>,
}

/// Per-element metadata carried into tiles and the object table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attributes {
    pub class: String,
    pub group: String,
    pub space: String,
    pub name: Option<String>,
    pub properties: Vec<PropertySetRow>,
}

impl Attributes {
    pub fn from_entity(entity: &SourceEntity, group: &str, space: &str) -> Self {
        let properties = entity
            .property_sets
            .iter()
            .filter(|pset| pset.class == "IfcPropertySet")
            .filter_map(|pset| {
                let name = pset.name.clone()?;
                let values = pset
                    .properties
                    .iter()
                    .filter_map(|prop| match (&prop.name, &prop.value) {
                        (Some(n), v @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => {
                            Some((n.clone(), v.clone()))
                        }
                        _ => None,
                    })
                    .collect();
                Some(PropertySetRow { name, values })
            })
            .collect();

        Self {
            class: entity.class.clone(),
            group: group.to_owned(),
            space: space.to_owned(),
            name: entity.name.clone(),
            properties,
        }
    }
}

/// One source element. Immutable once built; collection placement lives in
/// [`crate::Placement`].
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    id: String,
    attributes: Attributes,
    triangles: Vec<Triangle>,
    parts: Vec<MaterialPart>,
    ancestors: Vec<AncestorRef>,
    bbox: Option<BoundingBox>,
}

impl Element {
    pub fn new(id: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes {
                class: class.into(),
                group: NONE_LABEL.to_owned(),
                space: NONE_LABEL.to_owned(),
                name: None,
                properties: Vec::new(),
            },
            triangles: Vec::new(),
            parts: Vec::new(),
            ancestors: Vec::new(),
            bbox: None,
        }
    }

    pub fn with_labels(mut self, group: &str, space: &str) -> Self {
        self.attributes.group = group.to_owned();
        self.attributes.space = space.to_owned();
        self
    }

    pub fn with_mesh(mut self, triangles: Vec<Triangle>, parts: Vec<MaterialPart>) -> Self {
        self.bbox = BoundingBox::from_triangles(&triangles);
        self.triangles = triangles;
        self.parts = parts;
        self
    }

    pub fn with_ancestors(mut self, ancestors: Vec<AncestorRef>) -> Self {
        self.ancestors = ancestors;
        self
    }

    /// Build an element from a kernel entity.
    ///
    /// Missing or unbuildable geometry is not an error: the element comes back
    /// with `has_geometry() == false`. Other kernel failures are reported as
    /// [`Error::ElementProcessing`].
    pub fn from_entity<K: GeometryKernel + ?Sized>(
        kernel: &K,
        entity: &SourceEntity,
        group: &str,
        space: &str,
        with_hierarchy: bool,
    ) -> Result<Self> {
        let processing = |source: KernelError| Error::ElementProcessing {
            id: entity.global_id.clone(),
            source,
        };

        let mut element = Self::new(entity.global_id.clone(), entity.class.clone());
        element.attributes = Attributes::from_entity(entity, group, space);

        let geometry = match kernel.create_shape(entity) {
            Ok(Some(shape)) => partition(&shape),
            Ok(None) => {
                debug!("{} ({}) has no representation", entity.global_id, entity.class);
                Ok((Vec::new(), Vec::new()))
            }
            Err(err) => Err(err),
        };

        match geometry {
            Ok((triangles, parts)) => {
                if triangles.is_empty() && entity.representation.is_some() {
                    warn!("{}: no triangles found", entity.global_id);
                }
                element = element.with_mesh(triangles, parts);
            }
            Err(KernelError::Shape(msg)) => {
                warn!("error while creating geometry for {}: {}", entity.global_id, msg);
            }
            Err(other) => return Err(processing(other)),
        }

        if with_hierarchy {
            element.ancestors = ancestor_chain(kernel, entity).map_err(processing)?;
        }

        Ok(element)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class(&self) -> &str {
        &self.attributes.class
    }

    pub fn group(&self) -> &str {
        &self.attributes.group
    }

    pub fn space(&self) -> &str {
        &self.attributes.space
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn has_geometry(&self) -> bool {
        !self.triangles.is_empty()
    }

    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn parts(&self) -> &[MaterialPart] {
        &self.parts
    }

    /// Nearest container first.
    pub fn ancestors(&self) -> &[AncestorRef] {
        &self.ancestors
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        self.bbox
    }

    /// Mean of all triangle vertices; origin for an element without geometry.
    pub fn centroid(&self) -> Point {
        let mut sum = [0.0; 3];
        let mut count = 0usize;
        for p in self.triangles.iter().flatten() {
            sum[0] += p[0];
            sum[1] += p[1];
            sum[2] += p[2];
            count += 1;
        }
        if count == 0 {
            return sum;
        }
        let n = count as f64;
        [sum[0] / n, sum[1] / n, sum[2] / n]
    }
}

/// Expand indexed faces to triangles and split them by per-face material id.
fn partition(shape: &Shape) -> Result<(Vec<Triangle>, Vec<MaterialPart>), KernelError> {
    let mut triangles = Vec::with_capacity(shape.faces.len());
    for face in &shape.faces {
        let mut triangle = [[0.0; 3]; 3];
        for (corner, &index) in triangle.iter_mut().zip(face) {
            *corner = *shape.verts.get(index as usize).ok_or_else(|| {
                KernelError::Shape(format!("face references missing vertex {index}"))
            })?;
        }
        triangles.push(triangle);
    }

    if shape.materials.is_empty() || triangles.is_empty() {
        return Ok((triangles, Vec::new()));
    }

    let ids: Vec<i64> = match shape.material_ids.as_ref() {
        Some(ids) if ids.len() == triangles.len() => ids.clone(),
        _ => vec![0; triangles.len()],
    };

    // Parts are ordered by first appearance of their material id.
    let mut by_id: IndexMap<i64, Vec<usize>> = IndexMap::new();
    for (face, &mid) in ids.iter().enumerate() {
        by_id.entry(mid).or_default().push(face);
    }

    let parts = by_id
        .into_iter()
        .map(|(mid, face_indices)| {
            let style = usize::try_from(mid)
                .ok()
                .and_then(|i| shape.materials.get(i))
                .unwrap_or(&shape.materials[0]);
            MaterialPart {
                material: Material::resolve(style),
                face_indices,
            }
        })
        .collect();

    Ok((triangles, parts))
}

/// Walk containment upwards, nearest container first.
fn ancestor_chain<K: GeometryKernel + ?Sized>(
    kernel: &K,
    entity: &SourceEntity,
) -> Result<Vec<AncestorRef>, KernelError> {
    let mut chain = Vec::new();
    let mut seen = HashSet::from([entity.id]);
    let mut current = entity;

    while let Some(parent) = kernel.parent(current)? {
        if !seen.insert(parent.id) {
            warn!(
                "containment cycle at {} while walking up from {}; chain truncated",
                parent.global_id, entity.global_id
            );
            break;
        }
        if chain.len() >= MAX_RELATION_DEPTH {
            warn!(
                "containment deeper than {} above {}; chain truncated",
                MAX_RELATION_DEPTH, entity.global_id
            );
            break;
        }
        chain.push(AncestorRef {
            id: parent.global_id.clone(),
            class: parent.class.clone(),
        });
        current = parent;
    }

    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::JsonModel;
    use crate::material::rgba_to_hex;
    use serde_json::json;

    fn model(value: Value) -> JsonModel {
        JsonModel::from_export(serde_json::from_value(value).unwrap())
    }

    fn quad() -> Value {
        json!([0, 0, 0, 1, 0, 0, 1, 1, 0, 0, 1, 0])
    }

    #[test]
    fn empty_property_sets_give_empty_properties() {
        let m = model(json!({
            "entities": [ { "id": 1, "global_id": "A", "class": "IfcBuildingElementProxy" } ]
        }));
        let e = Element::from_entity(&m, m.get(1).unwrap(), NONE_LABEL, NONE_LABEL, false).unwrap();
        assert!(e.attributes().properties.is_empty());
        assert!(!e.has_geometry());
        assert_eq!(e.group(), "None");
    }

    #[test]
    fn unnamed_sets_and_non_atomic_values_are_skipped() {
        let m = model(json!({
            "entities": [ {
                "id": 1, "global_id": "A", "class": "IfcWall", "name": "W1",
                "property_sets": [
                    { "properties": [ { "name": "X", "value": 1 } ] },
                    { "class": "IfcElementQuantity", "name": "Qto", "properties": [] },
                    { "name": "Pset_WallCommon", "properties": [
                        { "name": "IsExternal", "value": true },
                        { "name": "Layers", "value": [1, 2] },
                        { "name": "Reference", "value": "W-01" },
                        { "name": "Empty" },
                        { "value": 3.5 }
                    ] }
                ]
            } ]
        }));
        let e = Element::from_entity(&m, m.get(1).unwrap(), "G", NONE_LABEL, false).unwrap();
        let attrs = e.attributes();
        assert_eq!(attrs.name.as_deref(), Some("W1"));
        assert_eq!(attrs.group, "G");
        assert_eq!(attrs.properties.len(), 1);
        assert_eq!(attrs.properties[0].name, "Pset_WallCommon");
        assert_eq!(
            attrs.properties[0].values,
            vec![
                ("IsExternal".to_owned(), json!(true)),
                ("Reference".to_owned(), json!("W-01")),
            ]
        );
    }

    #[test]
    fn faces_are_partitioned_by_material_in_first_seen_order() {
        let m = model(json!({
            "entities": [ {
                "id": 1, "global_id": "SIGN", "class": "IfcSign",
                "representation": {
                    "verts": quad(),
                    "faces": [0, 1, 2, 0, 2, 3, 0, 1, 3],
                    "materials": [ { "diffuse": [1.0, 0.0, 0.0] }, { "diffuse": [0.0, 0.0, 1.0] } ],
                    "material_ids": [1, 0, 1]
                }
            } ]
        }));
        let e = Element::from_entity(&m, m.get(1).unwrap(), NONE_LABEL, NONE_LABEL, false).unwrap();

        assert!(e.has_geometry());
        assert_eq!(e.triangle_count(), 3);
        assert_eq!(e.parts().len(), 2);
        assert_eq!(rgba_to_hex(e.parts()[0].material.rgba), "#0000FFFF");
        assert_eq!(e.parts()[0].face_indices, vec![0, 2]);
        assert_eq!(rgba_to_hex(e.parts()[1].material.rgba), "#FF0000FF");
        assert_eq!(e.parts()[1].face_indices, vec![1]);
        assert_eq!(e.bounding_box().unwrap().max, [1.0, 1.0, 0.0]);
    }

    #[test]
    fn mismatched_material_ids_give_one_part() {
        let m = model(json!({
            "entities": [ {
                "id": 1, "global_id": "A", "class": "IfcSlab",
                "representation": {
                    "verts": quad(),
                    "faces": [0, 1, 2, 0, 2, 3],
                    "materials": [ { "diffuse": [0.5, 0.5, 0.5] }, { "diffuse": [0.0, 1.0, 0.0] } ],
                    "material_ids": [1]
                }
            }, {
                "id": 2, "global_id": "B", "class": "IfcSlab",
                "representation": { "verts": quad(), "faces": [0, 1, 2] }
            } ]
        }));

        let a = Element::from_entity(&m, m.get(1).unwrap(), NONE_LABEL, NONE_LABEL, false).unwrap();
        assert_eq!(a.parts().len(), 1);
        assert_eq!(a.parts()[0].face_indices, vec![0, 1]);
        assert_eq!(rgba_to_hex(a.parts()[0].material.rgba), "#808080FF");

        let b = Element::from_entity(&m, m.get(2).unwrap(), NONE_LABEL, NONE_LABEL, false).unwrap();
        assert!(b.has_geometry());
        assert!(b.parts().is_empty());
    }

    #[test]
    fn failed_or_empty_shapes_have_no_geometry() {
        let m = model(json!({
            "entities": [
                { "id": 1, "global_id": "A", "class": "IfcWall", "representation": { "error": "no solid" } },
                { "id": 2, "global_id": "B", "class": "IfcWall", "representation": { "verts": quad(), "faces": [] } }
            ]
        }));
        for id in [1, 2] {
            let e = Element::from_entity(&m, m.get(id).unwrap(), NONE_LABEL, NONE_LABEL, false).unwrap();
            assert!(!e.has_geometry());
            assert!(e.bounding_box().is_none());
        }
    }

    #[test]
    fn ancestor_chain_runs_nearest_first_and_stops_on_cycles() {
        let m = model(json!({
            "entities": [
                { "id": 1, "global_id": "SITE", "class": "IfcSite", "kind": "spatial" },
                { "id": 2, "global_id": "BLDG", "class": "IfcBuilding", "kind": "building", "decomposes": [1] },
                { "id": 3, "global_id": "L1", "class": "IfcBuildingStorey", "kind": "spatial", "decomposes": [2] },
                { "id": 4, "global_id": "DOOR", "class": "IfcDoor", "container": 3 },
                { "id": 5, "global_id": "X", "class": "IfcWall", "container": 6 },
                { "id": 6, "global_id": "Y", "class": "IfcWall", "container": 5 }
            ]
        }));

        let door = Element::from_entity(&m, m.get(4).unwrap(), NONE_LABEL, NONE_LABEL, true).unwrap();
        let ids: Vec<_> = door.ancestors().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["L1", "BLDG", "SITE"]);
        assert_eq!(door.ancestors()[1].class, "IfcBuilding");

        let x = Element::from_entity(&m, m.get(5).unwrap(), NONE_LABEL, NONE_LABEL, true).unwrap();
        let ids: Vec<_> = x.ancestors().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["Y"]);
    }

    #[test]
    fn deep_containment_is_cut_at_the_depth_limit() {
        let mut entities = vec![json!({ "id": 0, "global_id": "LEAF", "class": "IfcWall", "container": 1 })];
        for id in 1..=400u64 {
            let mut storey = json!({ "id": id, "global_id": format!("S{id}"), "class": "IfcBuildingStorey", "kind": "spatial" });
            if id < 400 {
                storey["container"] = json!(id + 1);
            }
            entities.push(storey);
        }
        let m = model(json!({ "entities": entities }));

        let leaf = Element::from_entity(&m, m.get(0).unwrap(), NONE_LABEL, NONE_LABEL, true).unwrap();
        assert_eq!(leaf.ancestors().len(), MAX_RELATION_DEPTH);
        assert_eq!(leaf.ancestors()[0].id, "S1");
        assert_eq!(leaf.ancestors()[MAX_RELATION_DEPTH - 1].id, "S256");
    }

    #[test]
    fn dangling_relation_fails_the_element() {
        let m = model(json!({
            "entities": [ { "id": 1, "global_id": "A", "class": "IfcWall", "container": 42 } ]
        }));
        let err = Element::from_entity(&m, m.get(1).unwrap(), NONE_LABEL, NONE_LABEL, true).unwrap_err();
        assert!(matches!(err, Error::ElementProcessing { ref id, .. } if id == "A"));
    }

    #[test]
    fn centroid_is_vertex_mean() {
        let e = Element::new("A", "IfcSlab").with_mesh(
            vec![[[0.0, 0.0, 0.0], [3.0, 0.0, 0.0], [0.0, 3.0, 3.0]]],
            Vec::new(),
        );
        assert_eq!(e.centroid(), [1.0, 1.0, 1.0]);
    }
}
