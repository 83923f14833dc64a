//! Mesh payloads and per-triangle shader colors.

use std::fmt::Write as _;

use miniz_oxide::deflate::compress_to_vec_zlib;
use miniz_oxide::inflate::decompress_to_vec_zlib;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::element::{MaterialPart, Triangle};
use crate::error::{Error, Result};
use crate::material::rgba_to_hex;

pub const TRIANGLE_CODEC: &str = "zlib";
pub const TRIANGLE_DTYPE: &str = "float32";

const ZLIB_LEVEL: u8 = 3;

/// `f32` triangle, (vertex, axis).
type PackedTriangle = [[f32; 3]; 3];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecMeta {
    pub codec: String,
    pub dtype: String,
    pub shape: [usize; 3],
}

#[derive(Debug, Clone)]
pub struct TriangleBlob {
    pub bytes: Vec<u8>,
    pub triangle_count: usize,
    pub meta: CodecMeta,
}

/// Pack triangles as little-endian `f32` `(N, 3, 3)` and zlib them.
pub fn encode_triangles(triangles: &[Triangle]) -> TriangleBlob {
    let packed: Vec<PackedTriangle> = triangles
        .iter()
        .map(|t| t.map(|p| p.map(|c| c as f32)))
        .collect();

    #[cfg(target_endian = "little")]
    let raw: &[u8] = bytemuck::cast_slice(&packed);

    #[cfg(not(target_endian = "little"))]
    let raw_owned: Vec<u8> = packed
        .iter()
        .flatten()
        .flatten()
        .flat_map(|c| c.to_le_bytes())
        .collect();
    #[cfg(not(target_endian = "little"))]
    let raw: &[u8] = &raw_owned;

    TriangleBlob {
        bytes: compress_to_vec_zlib(raw, ZLIB_LEVEL),
        triangle_count: packed.len(),
        meta: CodecMeta {
            codec: TRIANGLE_CODEC.to_owned(),
            dtype: TRIANGLE_DTYPE.to_owned(),
            shape: [packed.len(), 3, 3],
        },
    }
}

/// Inverse of [`encode_triangles`]; returns the stored `f32` values.
pub fn decode_triangles(bytes: &[u8], meta: &CodecMeta) -> Result<Vec<[[f32; 3]; 3]>> {
    if meta.codec != TRIANGLE_CODEC || meta.dtype != TRIANGLE_DTYPE || meta.shape[1..] != [3, 3] {
        return Err(Error::Codec(format!(
            "unsupported layout {}/{} {:?}",
            meta.codec, meta.dtype, meta.shape
        )));
    }

    let raw = decompress_to_vec_zlib(bytes)
        .map_err(|e| Error::Codec(format!("zlib inflate failed: {e:?}")))?;

    let expected = meta.shape[0]
        .checked_mul(std::mem::size_of::<PackedTriangle>())
        .ok_or_else(|| Error::Codec(format!("shape {:?} overflows", meta.shape)))?;
    if raw.len() != expected {
        return Err(Error::Codec(format!(
            "payload is {} bytes, shape {:?} needs {}",
            raw.len(),
            meta.shape,
            expected
        )));
    }

    let floats: Vec<f32> = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(floats
        .chunks_exact(9)
        .map(|c| [[c[0], c[1], c[2]], [c[3], c[4], c[5]], [c[6], c[7], c[8]]])
        .collect())
}

/// One hex color per triangle: `default_hex`, overwritten by each part's color
/// for its face indices. Indices past `triangle_count` are ignored.
pub fn expand_shader_colors(
    triangle_count: usize,
    parts: &[MaterialPart],
    default_hex: &str,
) -> Vec<String> {
    let mut colors = vec![default_hex.to_owned(); triangle_count];

    for part in parts {
        let hex = rgba_to_hex(part.material.rgba);
        for &face in &part.face_indices {
            if let Some(slot) = colors.get_mut(face) {
                slot.clone_from(&hex);
            }
        }
    }

    colors
}

/// Shader document stored next to a mesh.
pub fn shader_document(colors: Vec<String>) -> Value {
    json!({ "PbrMetallicRoughness": { "BaseColors": colors } })
}

/// EWKT polyhedral surface, one closed ring per triangle.
///
/// Linear in the triangle count but string-heavy; only used when solid
/// geometry persistence is switched on.
pub fn polyhedral_surface_ewkt(triangles: &[Triangle], srid: i32) -> String {
    let mut out = String::with_capacity(32 + triangles.len() * 128);
    let _ = write!(out, "SRID={srid};POLYHEDRALSURFACE Z (");

    for (i, [p0, p1, p2]) in triangles.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str("((");
        for (j, p) in [p0, p1, p2, p0].into_iter().enumerate() {
            if j > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{} {} {}", p[0], p[1], p[2]);
        }
        out.push_str("))");
    }

    out.push(')');
    out
}

/// EWKT point, used for element centroids.
pub fn point_ewkt(p: [f64; 3], srid: i32) -> String {
    format!("SRID={srid};POINT Z ({} {} {})", p[0], p[1], p[2])
}
