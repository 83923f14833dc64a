use std::path::PathBuf;

use bimtile::material::{parse_hex, rgba_to_hex, DEFAULT_MESH_HEX};
use bimtile::{GroupingStrategy, StoreOptions, TilerOptions};
use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum GroupedBy {
    /// One tile per IFC class in each building.
    Type,
    /// One tile per `IfcGroup`.
    Group,
    /// One tile per `IfcSpace`.
    Space,
}

impl From<GroupedBy> for GroupingStrategy {
    fn from(value: GroupedBy) -> Self {
        match value {
            GroupedBy::Type => GroupingStrategy::ByType,
            GroupedBy::Group => GroupingStrategy::ByGroup,
            GroupedBy::Space => GroupingStrategy::BySpace,
        }
    }
}

/// `ifc2tiles` - groups triangulated IFC elements into tiles.
///
/// Reads geometry kernel exports (`.json`, or a `.zip` holding one), buckets
/// their elements, writes a `tileset.json` manifest and optionally upserts
/// everything into a SQLite database.
#[derive(Parser, Debug, Clone)]
#[command(name = "ifc2tiles", version, about, long_about = None)]
pub struct Config {
    /// Kernel export files or directories to scan.
    #[arg(required = true, num_args = 1..)]
    pub paths: Vec<PathBuf>,

    #[arg(long, default_value = "tiles_out")]
    pub output_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = GroupedBy::Type)]
    pub grouped_by: GroupedBy,

    /// Attach the `3DTILES_batch_table_hierarchy` extension to every tile.
    #[arg(long, default_value_t = false)]
    pub with_bth: bool,

    /// SQLite database to upsert runs, objects, meshes and materials into.
    #[arg(long, env = "IFC2TILES_DB")]
    pub db: Option<PathBuf>,

    /// Also persist the full polyhedral surface of every mesh.
    #[arg(long, default_value_t = false)]
    pub write_geom: bool,

    #[arg(long, env = "IFC2TILES_SRID", default_value_t = 5186)]
    pub srid: i32,

    /// Shader color for triangles without a material, `#RRGGBB[AA]`.
    #[arg(long, default_value = DEFAULT_MESH_HEX, value_parser = parse_color)]
    pub default_color: String,
}

fn parse_color(s: &str) -> Result<String, String> {
    parse_hex(s)
        .map(rgba_to_hex)
        .ok_or_else(|| format!("`{s}` is not a #RRGGBB or #RRGGBBAA color"))
}

impl Config {
    pub fn tiler_options(&self) -> TilerOptions {
        TilerOptions {
            grouping: self.grouped_by.into(),
            with_hierarchy: self.with_bth,
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            srid: self.srid,
            write_geometry: self.write_geom,
            default_hex: self.default_color.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["ifc2tiles", "model.json"]).unwrap();
        assert_eq!(config.tiler_options(), TilerOptions::default());
        assert_eq!(config.store_options().default_hex, "#FFFFFFFF");
        assert_eq!(config.output_dir, PathBuf::from("tiles_out"));
    }

    #[test]
    fn flags_map_onto_library_options() {
        let config = Config::try_parse_from([
            "ifc2tiles",
            "a.json",
            "models/",
            "--grouped-by",
            "space",
            "--with-bth",
            "--write-geom",
            "--srid",
            "4326",
            "--default-color",
            "#ff8000",
        ])
        .unwrap();

        assert_eq!(config.paths.len(), 2);
        assert_eq!(config.tiler_options().grouping, GroupingStrategy::BySpace);
        assert!(config.tiler_options().with_hierarchy);
        let store = config.store_options();
        assert!(store.write_geometry);
        assert_eq!(store.srid, 4326);
        assert_eq!(store.default_hex, "#FF8000FF");
    }

    #[test]
    fn bad_color_is_rejected() {
        assert!(Config::try_parse_from(["ifc2tiles", "a.json", "--default-color", "red"]).is_err());
    }
}
