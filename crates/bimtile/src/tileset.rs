//! `tileset.json` manifest over the groups of every processed file.
//!
//! One child tile per non-empty group. Tile payloads are written by the
//! tileset library; the manifest carries what the tiler decided: bounds,
//! element order, the material slot table and, when built, the batch table
//! hierarchy.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde_json::{json, Value};

use crate::element::BoundingBox;
use crate::error::Result;
use crate::group::GroupCollection;
use crate::hierarchy::HierarchyTable;
use crate::pipeline::FileOutput;

pub const TILESET_VERSION: &str = "1.0";
pub const HIERARCHY_EXTENSION: &str = "3DTILES_batch_table_hierarchy";
pub const TILESET_FILE: &str = "tileset.json";

const GENERATOR: &str = concat!("bimtile ", env!("CARGO_PKG_VERSION"));

/// Render the manifest document.
pub fn manifest(outputs: &[FileOutput]) -> Value {
    let mut children = Vec::new();
    let mut bounds: Option<BoundingBox> = None;

    for output in outputs {
        for (i, group) in output.groups.iter().enumerate() {
            let hierarchy = output.hierarchies.as_ref().and_then(|h| h.get(i));
            if let Some(tile) = group_tile(&output.source, group, hierarchy) {
                children.push(tile);
            }
            if let Some(bbox) = group.bounding_box() {
                bounds = Some(match bounds {
                    Some(acc) => acc.union(bbox),
                    None => bbox,
                });
            }
        }
    }

    let bounds = bounds.unwrap_or(BoundingBox {
        min: [0.0; 3],
        max: [0.0; 3],
    });

    let mut extensions_used = Vec::new();
    if outputs.iter().any(|o| o.hierarchies.is_some()) {
        extensions_used.push(HIERARCHY_EXTENSION);
    }

    let mut tileset = json!({
        "asset": {
            "version": TILESET_VERSION,
            "generator": GENERATOR,
            "extras": {
                "sources": outputs.iter().map(|o| o.source.display().to_string()).collect::<Vec<_>>(),
            },
        },
        "geometricError": diagonal(&bounds),
        "root": {
            "boundingVolume": { "box": box_volume(&bounds) },
            "geometricError": diagonal(&bounds),
            "refine": "ADD",
            "children": children,
        },
    });

    if !extensions_used.is_empty() {
        tileset["extensionsUsed"] = json!(extensions_used);
    }

    tileset
}

/// Write `tileset.json` into `out_dir`, creating the directory if needed.
pub fn write_manifest(outputs: &[FileOutput], out_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)?;
    let path = out_dir.join(TILESET_FILE);
    let doc = manifest(outputs);
    fs::write(&path, serde_json::to_string_pretty(&doc)?)?;

    let tiles = doc["root"]["children"].as_array().map_or(0, Vec::len);
    info!("wrote {} ({} tiles)", path.display(), tiles);
    Ok(path)
}

fn group_tile(source: &Path, group: &GroupCollection, hierarchy: Option<&HierarchyTable>) -> Option<Value> {
    let bbox = group.bounding_box()?;

    let elements: Vec<Value> = group
        .elements()
        .iter()
        .map(|placed| {
            json!({
                "id": placed.element.id(),
                "class": placed.element.class(),
                "name": placed.element.attributes().name,
                "materialIndex": placed.placement.material_index,
                "triangles": placed.element.triangle_count(),
            })
        })
        .collect();
    let materials: Vec<String> = group.materials().map(|m| m.hex()).collect();

    let mut tile = json!({
        "boundingVolume": { "box": box_volume(&bbox) },
        "geometricError": 0.0,
        "extras": {
            "group": group.key(),
            "source": source.display().to_string(),
            "elements": elements,
            "materials": materials,
        },
    });

    if let Some(hierarchy) = hierarchy {
        tile["extensions"] = json!({ HIERARCHY_EXTENSION: hierarchy.to_extension() });
    }

    Some(tile)
}

/// `[cx, cy, cz, hx, 0, 0, 0, hy, 0, 0, 0, hz]`
fn box_volume(bbox: &BoundingBox) -> [f64; 12] {
    let c = bbox.center();
    let h = [
        0.5 * (bbox.max[0] - bbox.min[0]),
        0.5 * (bbox.max[1] - bbox.min[1]),
        0.5 * (bbox.max[2] - bbox.min[2]),
    ];
    [
        c[0], c[1], c[2], h[0], 0.0, 0.0, 0.0, h[1], 0.0, 0.0, 0.0, h[2],
    ]
}

fn diagonal(bbox: &BoundingBox) -> f64 {
    (0..3)
        .map(|axis| (bbox.max[axis] - bbox.min[axis]).powi(2))
        .sum::<f64>()
        .sqrt()
}
