//! Canonical colors and content fingerprints for materials.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::kernel::SurfaceStyle;

/// RGBA, each channel in `[0, 1]`.
pub type Rgba = [f64; 4];

/// Fallback for materials whose color cannot be interpreted.
pub const DEFAULT_MATERIAL_HEX: &str = "#F0F0F0FF";

/// Fallback for triangles not covered by any material part.
pub const DEFAULT_MESH_HEX: &str = "#FFFFFFFF";

const DEFAULT_MATERIAL_RGBA: Rgba = [240.0 / 255.0, 240.0 / 255.0, 240.0 / 255.0, 1.0];

/// Anything that can describe a material: a color plus optional extra fields.
pub trait MaterialSource {
    /// `None` when the source carries no interpretable color.
    fn rgba(&self) -> Option<Rgba>;

    /// Non-color fields that take part in the fingerprint.
    fn extras(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }
}

/// Canonical material: what gets deduplicated, stored and fingerprinted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub rgba: Rgba,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, Value>,
}

impl Material {
    pub fn from_rgba(rgba: Rgba) -> Self {
        Self {
            rgba,
            extras: BTreeMap::new(),
        }
    }

    pub fn resolve<S: MaterialSource + ?Sized>(source: &S) -> Self {
        let rgba = match source.rgba() {
            Some(rgba) => rgba,
            None => {
                debug!("material color not resolvable, using {DEFAULT_MATERIAL_HEX}");
                DEFAULT_MATERIAL_RGBA
            }
        };

        Self {
            rgba,
            extras: source.extras(),
        }
    }

    pub fn hex(&self) -> String {
        rgba_to_hex(self.rgba)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        // serde_json::Map keeps keys sorted, so the payload is canonical.
        let payload = json!({ "extras": self.extras, "rgba": self.rgba });

        let mut hasher = Sha256::new();
        hasher.update(payload.to_string().as_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }
}

impl MaterialSource for Material {
    fn rgba(&self) -> Option<Rgba> {
        Some(self.rgba)
    }

    fn extras(&self) -> BTreeMap<String, Value> {
        self.extras.clone()
    }
}

/// Kernel surface styles contribute their diffuse color only; alpha is fixed at 1.
impl MaterialSource for SurfaceStyle {
    fn rgba(&self) -> Option<Rgba> {
        self.diffuse.map(|[r, g, b]| [r, g, b, 1.0])
    }
}

/// glTF-style mapping: `pbrMetallicRoughness.baseColorFactor` is the color,
/// every other field is an extra.
impl MaterialSource for Value {
    fn rgba(&self) -> Option<Rgba> {
        let factor = self
            .get("pbrMetallicRoughness")?
            .get("baseColorFactor")?
            .as_array()?;

        if factor.len() != 4 {
            return None;
        }

        let mut rgba = [0.0; 4];
        for (slot, value) in rgba.iter_mut().zip(factor) {
            *slot = value.as_f64()?;
        }
        Some(rgba)
    }

    fn extras(&self) -> BTreeMap<String, Value> {
        let Some(object) = self.as_object() else {
            let mut extras = BTreeMap::new();
            extras.insert("_material_repr".to_owned(), Value::String(self.to_string()));
            return extras;
        };

        let mut extras: BTreeMap<String, Value> = object
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if let Some(Value::Object(pbr)) = extras.get_mut("pbrMetallicRoughness") {
            pbr.remove("baseColorFactor");
            if pbr.is_empty() {
                extras.remove("pbrMetallicRoughness");
            }
        }

        extras
    }
}

pub fn canonical_color<S: MaterialSource + ?Sized>(source: &S) -> Rgba {
    Material::resolve(source).rgba
}

pub fn fingerprint<S: MaterialSource + ?Sized>(source: &S) -> Fingerprint {
    Material::resolve(source).fingerprint()
}

/// SHA-256 over a material's canonical payload, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `#RRGGBBAA`, channels clamped to `[0, 1]`.
pub fn rgba_to_hex(rgba: Rgba) -> String {
    #[inline]
    fn channel(x: f64) -> u8 {
        (x.clamp(0.0, 1.0) * 255.0).round() as u8
    }

    format!(
        "#{:02X}{:02X}{:02X}{:02X}",
        channel(rgba[0]),
        channel(rgba[1]),
        channel(rgba[2]),
        channel(rgba[3])
    )
}

/// Parse `#RRGGBB` or `#RRGGBBAA` (leading `#` optional).
pub fn parse_hex(s: &str) -> Option<Rgba> {
    let digits = s.strip_prefix('#').unwrap_or(s);
    if !(digits.len() == 6 || digits.len() == 8) || !digits.is_ascii() {
        return None;
    }

    let mut rgba = [1.0; 4];
    for (i, slot) in rgba.iter_mut().enumerate().take(digits.len() / 2) {
        let byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16).ok()?;
        *slot = byte as f64 / 255.0;
    }
    Some(rgba)
}
