//! Bucketing policies that turn a kernel model into group collections.

use std::collections::HashSet;
use std::time::Instant;

use indexmap::{IndexMap, IndexSet};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::element::Element;
use crate::error::KernelError;
use crate::group::GroupCollection;
use crate::kernel::{EntityKind, GeometryKernel, SourceEntity, MAX_RELATION_DEPTH};
use crate::NONE_LABEL;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupingStrategy {
    /// One collection per (class, building).
    #[default]
    ByType,
    /// One collection per `IfcGroup`, plus `"None"`.
    ByGroup,
    /// One collection per `IfcSpace`, plus `"None"`.
    BySpace,
}

impl GroupingStrategy {
    /// Bucket every entity of the model; empty collections are dropped.
    pub fn collect<K: GeometryKernel + ?Sized>(
        self,
        kernel: &K,
        with_hierarchy: bool,
    ) -> Vec<GroupCollection> {
        let buckets = match self {
            GroupingStrategy::ByType => by_type(kernel, with_hierarchy),
            GroupingStrategy::ByGroup => by_group(kernel, with_hierarchy),
            GroupingStrategy::BySpace => by_space(kernel, with_hierarchy),
        };

        info!(
            "{} elements placed, {} skipped",
            buckets.placed, buckets.skipped
        );

        buckets
            .groups
            .into_values()
            .filter(|group| !group.is_empty())
            .collect()
    }
}

struct Buckets {
    groups: IndexMap<String, GroupCollection>,
    with_hierarchy: bool,
    total: usize,
    seen: usize,
    placed: usize,
    skipped: usize,
}

impl Buckets {
    fn new(with_hierarchy: bool, total: usize) -> Self {
        Self {
            groups: IndexMap::new(),
            with_hierarchy,
            total,
            seen: 0,
            placed: 0,
            skipped: 0,
        }
    }

    fn ensure(&mut self, key: &str) {
        if !self.groups.contains_key(key) {
            self.groups.insert(key.to_owned(), GroupCollection::new(key));
        }
    }

    /// Build one element and append it under `key`. Failures are logged and
    /// the element is left out.
    fn place<K: GeometryKernel + ?Sized>(
        &mut self,
        kernel: &K,
        entity: &SourceEntity,
        key: &str,
        group: &str,
        space: &str,
    ) {
        self.seen += 1;
        let start = Instant::now();
        info!(
            "{} / {}: parsing {}, {}",
            self.seen, self.total, entity.global_id, entity.class
        );

        let element = match Element::from_entity(kernel, entity, group, space, self.with_hierarchy) {
            Ok(element) => element,
            Err(err) => {
                warn!("skipping {}: {}", entity.global_id, err);
                self.skipped += 1;
                return;
            }
        };

        if element.has_geometry() {
            self.ensure(key);
            match self.groups[key].append(element) {
                Ok(_) => self.placed += 1,
                Err(err) => {
                    warn!("skipping {}: {}", entity.global_id, err);
                    self.skipped += 1;
                }
            }
        } else {
            debug!("{} has no geometry, left out", entity.global_id);
            self.skipped += 1;
        }

        debug!("{} took {:.3?}", entity.global_id, start.elapsed());
    }
}

fn by_type<K: GeometryKernel + ?Sized>(kernel: &K, with_hierarchy: bool) -> Buckets {
    let buildings = kernel.by_kind(EntityKind::Building);
    let per_building: Vec<_> = buildings
        .iter()
        .map(|&building| (building, kernel.decomposition(building)))
        .collect();

    let total = per_building.iter().map(|(_, elements)| elements.len()).sum();
    let mut buckets = Buckets::new(with_hierarchy, total);

    for (building, elements) in per_building {
        info!(
            "{} elements to parse in building {}",
            elements.len(),
            building.global_id
        );
        for entity in elements {
            let key = format!("{}@{}", entity.class, building.global_id);
            buckets.place(kernel, entity, &key, NONE_LABEL, NONE_LABEL);
        }
    }

    buckets
}

fn by_group<K: GeometryKernel + ?Sized>(kernel: &K, with_hierarchy: bool) -> Buckets {
    let mut remaining: IndexSet<u64> = kernel
        .by_kind(EntityKind::Element)
        .iter()
        .map(|e| e.id)
        .collect();
    info!("{} elements to parse", remaining.len());

    let mut buckets = Buckets::new(with_hierarchy, remaining.len());

    let assignments = kernel.group_assignments();
    if assignments.is_empty() {
        info!("no IfcGroup found");
    }

    for assignment in assignments {
        buckets.ensure(&assignment.group);

        for &member in &assignment.members {
            let entity = match kernel.resolve(member) {
                Ok(entity) => entity,
                Err(err) => {
                    warn!("group {}: {}", assignment.group, err);
                    continue;
                }
            };
            if entity.kind != EntityKind::Element {
                continue;
            }
            if !remaining.shift_remove(&entity.id) {
                warn!(
                    "{} already placed in an earlier group; not added to {}",
                    entity.global_id, assignment.group
                );
                continue;
            }
            buckets.place(kernel, entity, &assignment.group, &assignment.group, NONE_LABEL);
        }
    }

    buckets.ensure(NONE_LABEL);
    for id in remaining {
        if let Some(entity) = kernel.get(id) {
            buckets.place(kernel, entity, NONE_LABEL, NONE_LABEL, NONE_LABEL);
        }
    }

    buckets
}

fn by_space<K: GeometryKernel + ?Sized>(kernel: &K, with_hierarchy: bool) -> Buckets {
    let spaces = kernel.by_kind(EntityKind::Space);
    let elements = kernel.by_kind(EntityKind::Element);
    info!("{} elements to parse", elements.len());
    info!("found {} IfcSpace", spaces.len());

    let mut buckets = Buckets::new(with_hierarchy, spaces.len() + elements.len());
    buckets.ensure(NONE_LABEL);

    // A space is drawn in its own tile, next to what it contains.
    for space in spaces {
        buckets.ensure(&space.global_id);
        buckets.place(kernel, space, &space.global_id, NONE_LABEL, &space.global_id);
    }

    for entity in elements {
        let key = match nearest_space(kernel, entity) {
            Ok(Some(space)) => space.global_id.as_str(),
            Ok(None) => NONE_LABEL,
            Err(err) => {
                buckets.seen += 1;
                buckets.skipped += 1;
                warn!("skipping {}: {}", entity.global_id, err);
                continue;
            }
        };
        buckets.place(kernel, entity, key, NONE_LABEL, key);
    }

    buckets
}

/// Smallest enclosing space along the parent chain.
fn nearest_space<'k, K: GeometryKernel + ?Sized>(
    kernel: &'k K,
    entity: &SourceEntity,
) -> Result<Option<&'k SourceEntity>, KernelError> {
    let mut seen = HashSet::from([entity.id]);
    let mut current = match kernel.parent(entity)? {
        Some(parent) => parent,
        None => return Ok(None),
    };

    for _ in 0..MAX_RELATION_DEPTH {
        if current.kind == EntityKind::Space {
            return Ok(Some(current));
        }
        if !seen.insert(current.id) {
            return Ok(None);
        }
        current = match kernel.parent(current)? {
            Some(parent) => parent,
            None => return Ok(None),
        };
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::JsonModel;
    use serde_json::{json, Value};

    fn model(value: Value) -> JsonModel {
        JsonModel::from_export(serde_json::from_value(value).unwrap())
    }

    fn tri() -> Value {
        json!({ "verts": [0, 0, 0, 1, 0, 0, 0, 1, 0], "faces": [0, 1, 2] })
    }

    fn keys(groups: &[GroupCollection]) -> Vec<&str> {
        groups.iter().map(|g| g.key()).collect()
    }

    fn ids(group: &GroupCollection) -> Vec<&str> {
        group.elements().iter().map(|p| p.element.id()).collect()
    }

    #[test]
    fn by_type_buckets_per_class_and_building() {
        let m = model(json!({
            "entities": [
                { "id": 1, "global_id": "B1", "class": "IfcBuilding", "kind": "building" },
                { "id": 2, "global_id": "L1", "class": "IfcBuildingStorey", "kind": "spatial", "decomposes": [1] },
                { "id": 3, "global_id": "W1", "class": "IfcWall", "container": 2, "representation": tri() },
                { "id": 4, "global_id": "S1", "class": "IfcSlab", "container": 2, "representation": tri() },
                { "id": 5, "global_id": "W2", "class": "IfcWall", "container": 2, "representation": tri() },
                { "id": 6, "global_id": "W3", "class": "IfcWall", "container": 2 },
                { "id": 7, "global_id": "LOOSE", "class": "IfcWall", "representation": tri() }
            ]
        }));

        let groups = GroupingStrategy::ByType.collect(&m, false);
        assert_eq!(keys(&groups), vec!["IfcWall@B1", "IfcSlab@B1"]);
        assert_eq!(ids(&groups[0]), vec!["W1", "W2"]);
        assert_eq!(ids(&groups[1]), vec!["S1"]);
    }

    #[test]
    fn by_group_uses_memberships_and_a_none_bucket() {
        let m = model(json!({
            "entities": [
                { "id": 1, "global_id": "A", "class": "IfcWall", "representation": tri() },
                { "id": 2, "global_id": "B", "class": "IfcWindow", "representation": tri() },
                { "id": 3, "global_id": "C", "class": "IfcDoor", "representation": tri() },
                { "id": 4, "global_id": "SP", "class": "IfcSpace", "kind": "space", "representation": tri() }
            ],
            "groups": [
                { "group": "Facade", "members": [2, 1, 4] },
                { "group": "Openings", "members": [2] },
                { "group": "Empty", "members": [] }
            ]
        }));

        let groups = GroupingStrategy::ByGroup.collect(&m, false);
        assert_eq!(keys(&groups), vec!["Facade", "None"]);
        assert_eq!(ids(&groups[0]), vec!["B", "A"]);
        assert_eq!(groups[0].elements()[0].element.group(), "Facade");
        assert_eq!(ids(&groups[1]), vec!["C"]);
        assert_eq!(groups[1].elements()[0].element.group(), "None");
    }

    #[test]
    fn a_failing_element_does_not_stop_the_batch() {
        let m = model(json!({
            "entities": [
                { "id": 1, "global_id": "BAD", "class": "IfcWall", "container": 999, "representation": tri() },
                { "id": 2, "global_id": "GOOD", "class": "IfcWall", "representation": tri() }
            ]
        }));

        let groups = GroupingStrategy::ByGroup.collect(&m, true);
        assert_eq!(keys(&groups), vec!["None"]);
        assert_eq!(ids(&groups[0]), vec!["GOOD"]);
    }

    #[test]
    fn a_space_beyond_the_depth_limit_is_not_found() {
        let mut entities = vec![
            json!({ "id": 0, "global_id": "CHAIR", "class": "IfcFurnishingElement", "container": 1, "representation": tri() }),
        ];
        for id in 1..=300u64 {
            entities.push(json!({ "id": id, "global_id": format!("S{id}"), "class": "IfcBuildingStorey", "kind": "spatial", "container": id + 1 }));
        }
        entities.push(json!({ "id": 301, "global_id": "ROOM", "class": "IfcSpace", "kind": "space" }));
        let m = model(json!({ "entities": entities }));

        assert!(nearest_space(&m, m.get(0).unwrap()).unwrap().is_none());
        let groups = GroupingStrategy::BySpace.collect(&m, false);
        assert_eq!(keys(&groups), vec!["None"]);
        assert_eq!(ids(&groups[0]), vec!["CHAIR"]);
    }

    #[test]
    fn by_space_follows_the_nearest_enclosing_space() {
        let m = model(json!({
            "entities": [
                { "id": 1, "global_id": "L1", "class": "IfcBuildingStorey", "kind": "spatial" },
                { "id": 2, "global_id": "ROOM", "class": "IfcSpace", "kind": "space", "decomposes": [1], "representation": tri() },
                { "id": 3, "global_id": "CHAIR", "class": "IfcFurnishingElement", "container": 2, "representation": tri() },
                { "id": 4, "global_id": "WALL", "class": "IfcWall", "container": 1, "representation": tri() },
                { "id": 5, "global_id": "OPENING", "class": "IfcOpeningElement", "voids": [6], "representation": tri() },
                { "id": 6, "global_id": "PARTITION", "class": "IfcWall", "container": 2 },
                { "id": 7, "global_id": "BROKEN", "class": "IfcWall", "container": 404, "representation": tri() }
            ]
        }));

        let groups = GroupingStrategy::BySpace.collect(&m, false);
        assert_eq!(keys(&groups), vec!["None", "ROOM"]);
        assert_eq!(ids(&groups[0]), vec!["WALL"]);
        assert_eq!(ids(&groups[1]), vec!["ROOM", "CHAIR", "OPENING"]);
        assert_eq!(groups[1].elements()[1].element.space(), "ROOM");
    }
}
