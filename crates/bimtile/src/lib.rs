//! bimtile: grouping, hierarchy and mesh/material encoding for IFC tiling.
//!
//! Input is the output of an external geometry kernel (see [`kernel`]): one
//! entity per IFC product with its property sets, containment relations and
//! triangulated shape. Output is
//!
//! - ordered [`GroupCollection`]s, one per grouping key, each owning its own
//!   material slot table (slots start at 0, assigned in insertion order),
//! - an optional [`HierarchyTable`] per collection for the
//!   `3DTILES_batch_table_hierarchy` extension,
//! - rows in a SQLite store ([`store`]) with zlib-packed triangles and
//!   fingerprint-deduplicated materials.
//!
//! Stored triangle payload (little-endian, zlib level 3):
//!   N * [ [f32; 3]; 3 ]   (triangle, vertex, axis)
//!
//! Codec metadata stored next to it:
//!   {"codec":"zlib","dtype":"float32","shape":[N,3,3]}
//!
//! Material fingerprint:
//!   sha256( {"extras":{..sorted..},"rgba":[r,g,b,a]} )  as lowercase hex

pub mod codec;
pub mod element;
pub mod error;
pub mod grouping;
pub mod group;
pub mod hierarchy;
pub mod input;
pub mod kernel;
pub mod material;
pub mod pipeline;
pub mod store;
pub mod tileset;

pub use element::{AncestorRef, Attributes, BoundingBox, Element, MaterialPart, Triangle};
pub use error::{Error, KernelError, Result};
pub use group::{GroupCollection, PlacedElement, Placement};
pub use grouping::GroupingStrategy;
pub use hierarchy::HierarchyTable;
pub use kernel::{GeometryKernel, JsonModel};
pub use material::{Fingerprint, Material, MaterialSource, Rgba};
pub use pipeline::{FileOutput, Tiler, TilerOptions};
pub use store::{Run, Store, StoreOptions};

/// Sentinel label for elements outside any group or space.
pub const NONE_LABEL: &str = "None";
