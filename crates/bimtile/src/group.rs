use indexmap::IndexMap;
use serde::Serialize;

use crate::element::{BoundingBox, Element};
use crate::error::{Error, Result};
use crate::hierarchy::HierarchyTable;
use crate::material::{Fingerprint, Material};

/// Slot indices resolved for an element inside one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    /// Slot of the first material part; 0 for elements without parts.
    pub material_index: usize,
    /// One slot per material part, same order as [`Element::parts`].
    pub part_slots: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct PlacedElement {
    pub element: Element,
    pub placement: Placement,
}

/// Append-only bucket of elements sharing a grouping key.
///
/// Materials are deduplicated per collection: the first time a fingerprint is
/// seen it takes the next free slot.
#[derive(Debug, Clone)]
pub struct GroupCollection {
    key: String,
    elements: Vec<PlacedElement>,
    materials: IndexMap<Fingerprint, Material>,
}

impl GroupCollection {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            elements: Vec::new(),
            materials: IndexMap::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Slot for `material`, inserting it if unseen.
    pub fn material_slot(&mut self, material: &Material) -> usize {
        let entry = self.materials.entry(material.fingerprint());
        let slot = entry.index();
        entry.or_insert_with(|| material.clone());
        slot
    }

    pub fn append(&mut self, element: Element) -> Result<&Placement> {
        if !element.has_geometry() {
            return Err(Error::GeometryUnavailable {
                id: element.id().to_owned(),
            });
        }

        let part_slots: Vec<usize> = element
            .parts()
            .iter()
            .map(|part| self.material_slot(&part.material))
            .collect();

        let placement = Placement {
            material_index: part_slots.first().copied().unwrap_or(0),
            part_slots,
        };

        self.elements.push(PlacedElement { element, placement });
        Ok(&self.elements[self.elements.len() - 1].placement)
    }

    pub fn elements(&self) -> &[PlacedElement] {
        &self.elements
    }

    /// Slot table in slot order.
    pub fn materials(&self) -> impl ExactSizeIterator<Item = &Material> + '_ {
        self.materials.values()
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        self.elements
            .iter()
            .filter_map(|placed| placed.element.bounding_box())
            .reduce(BoundingBox::union)
    }

    pub fn hierarchy(&self) -> HierarchyTable {
        HierarchyTable::build(self.elements.iter().map(|placed| &placed.element))
    }
}
