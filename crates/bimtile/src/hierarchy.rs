//! Parent/child table for the `3DTILES_batch_table_hierarchy` extension.
//!
//! Positions: the batch's elements take `[0, N)` in iteration order, then every
//! distinct ancestor that is not itself an element takes `[N, N + M)` in
//! first-seen order. Each node lists the positions of all its ancestors,
//! nearest first.

use std::collections::{HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};
use log::warn;
use serde::Serialize;
use serde_json::{json, Value};

use crate::element::Element;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub guid: String,
    /// Ancestor positions, nearest first.
    pub parents: Vec<usize>,
}

#[derive(Debug, Clone)]
struct Node {
    class: usize,
    instance: Instance,
}

#[derive(Debug, Clone, Default)]
pub struct HierarchyTable {
    positions: IndexMap<String, usize>,
    class_names: IndexSet<String>,
    /// Indexed by position.
    nodes: Vec<Node>,
}

impl HierarchyTable {
    pub fn build<'a, I>(elements: I) -> Self
    where
        I: IntoIterator<Item = &'a Element>,
    {
        let elements: Vec<&Element> = elements.into_iter().collect();

        // child -> parent; the first recorded edge wins
        let mut parent_of: HashMap<&str, &str> = HashMap::new();
        for element in &elements {
            let chain = element.ancestors();
            if let Some(nearest) = chain.first() {
                parent_of.entry(element.id()).or_insert(nearest.id.as_str());
            }
            for pair in chain.windows(2) {
                parent_of.entry(pair[0].id.as_str()).or_insert(pair[1].id.as_str());
            }
        }

        let mut positions: IndexMap<String, usize> = IndexMap::new();
        let mut order: Vec<(&str, &str)> = Vec::new();

        for element in &elements {
            if positions.contains_key(element.id()) {
                warn!("{} listed twice in one hierarchy batch", element.id());
                continue;
            }
            positions.insert(element.id().to_owned(), order.len());
            order.push((element.id(), element.class()));
        }
        for element in &elements {
            for ancestor in element.ancestors() {
                if !positions.contains_key(&ancestor.id) {
                    positions.insert(ancestor.id.clone(), order.len());
                    order.push((ancestor.id.as_str(), ancestor.class.as_str()));
                }
            }
        }

        let mut class_names = IndexSet::new();
        let nodes = order
            .iter()
            .map(|&(id, class)| {
                let (class, _) = class_names.insert_full(class.to_owned());
                let parents = walk_up(id, &parent_of)
                    .filter_map(|ancestor| positions.get(ancestor).copied())
                    .collect();
                Node {
                    class,
                    instance: Instance {
                        guid: id.to_owned(),
                        parents,
                    },
                }
            })
            .collect();

        Self {
            positions,
            class_names,
            nodes,
        }
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn instance(&self, position: usize) -> Option<&Instance> {
        self.nodes.get(position).map(|node| &node.instance)
    }

    /// Class name -> instances in position order; classes in first-seen order.
    pub fn classes(&self) -> IndexMap<&str, Vec<&Instance>> {
        let mut table: IndexMap<&str, Vec<&Instance>> = self
            .class_names
            .iter()
            .map(|name| (name.as_str(), Vec::new()))
            .collect();
        for node in &self.nodes {
            table[node.class].push(&node.instance);
        }
        table
    }

    /// Render the `3DTILES_batch_table_hierarchy` object.
    pub fn to_extension(&self) -> Value {
        let classes: Vec<Value> = self
            .classes()
            .into_iter()
            .map(|(name, instances)| {
                let guids: Vec<&str> = instances.iter().map(|i| i.guid.as_str()).collect();
                json!({
                    "name": name,
                    "length": instances.len(),
                    "instances": { "GUID": guids },
                })
            })
            .collect();

        let class_ids: Vec<usize> = self.nodes.iter().map(|n| n.class).collect();
        let parent_counts: Vec<usize> = self.nodes.iter().map(|n| n.instance.parents.len()).collect();
        let parent_ids: Vec<usize> = self
            .nodes
            .iter()
            .flat_map(|n| n.instance.parents.iter().copied())
            .collect();

        json!({
            "classes": classes,
            "instancesLength": self.nodes.len(),
            "classIds": class_ids,
            "parentCounts": parent_counts,
            "parentIds": parent_ids,
        })
    }
}

/// Ancestors of `id` along the edge map, stopping at the root or on a repeat.
fn walk_up<'a>(
    id: &'a str,
    parent_of: &'a HashMap<&'a str, &'a str>,
) -> impl Iterator<Item = &'a str> + 'a {
    let mut seen: HashSet<&str> = HashSet::from([id]);
    let mut current = id;
    std::iter::from_fn(move || {
        let next = *parent_of.get(current)?;
        if !seen.insert(next) {
            return None;
        }
        current = next;
        Some(next)
    })
}
