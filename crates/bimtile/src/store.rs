//! Relational persistence of runs, materials, objects and meshes.
//!
//! A [`Store`] owns one SQLite connection. [`Store::open_run`] starts a
//! [`Run`]: one transaction plus a material fingerprint cache that lives as
//! long as the run. [`Run::close`] commits; a run dropped without closing is
//! rolled back, so a failed source file leaves nothing behind.
//!
//! Every object, mesh and material-part write is an upsert keyed by GUID
//! (and material id for parts). Materials are keyed by fingerprint.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{
    encode_triangles, expand_shader_colors, point_ewkt, polyhedral_surface_ewkt, shader_document,
};
use crate::element::{Attributes, Element, MaterialPart, Point, Triangle};
use crate::error::{Error, Result};
use crate::material::{Fingerprint, Material, MaterialSource, DEFAULT_MESH_HEX};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ifc_run (
    run_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    ifc_name    TEXT NOT NULL,
    ifc_hash    TEXT,
    created_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS ifc_material (
    material_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    basecolor_hex TEXT NOT NULL,
    rgba          TEXT NOT NULL,
    extras        TEXT NOT NULL,
    fingerprint   TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS ifc_object (
    guid      TEXT PRIMARY KEY,
    run_id    INTEGER NOT NULL REFERENCES ifc_run (run_id),
    ifc_class TEXT NOT NULL,
    ifc_group TEXT,
    ifc_space TEXT,
    props     TEXT NOT NULL,
    centroid  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ifc_mesh (
    guid            TEXT PRIMARY KEY,
    geom            TEXT,
    triangles_blob  BLOB NOT NULL,
    triangles_count INTEGER NOT NULL,
    shaders         TEXT,
    extras          TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ifc_object_material_part (
    guid         TEXT NOT NULL,
    material_id  INTEGER NOT NULL REFERENCES ifc_material (material_id),
    face_indices TEXT NOT NULL,
    UNIQUE (guid, material_id)
);
";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Spatial reference written into every EWKT value.
    pub srid: i32,
    /// Persist the polyhedral surface next to the packed triangles.
    pub write_geometry: bool,
    /// Shader color for triangles outside every material part.
    pub default_hex: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            srid: 5186,
            write_geometry: false,
            default_hex: DEFAULT_MESH_HEX.to_owned(),
        }
    }
}

pub struct Store {
    conn: Connection,
    options: StoreOptions,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self> {
        Self::init(Connection::open(path)?, options)
    }

    pub fn open_in_memory(options: StoreOptions) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, options)
    }

    fn init(conn: Connection, options: StoreOptions) -> Result<Self> {
        // Runs for different files may share the database file.
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, options })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Read access for inspection; writes go through a [`Run`].
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn open_run(&mut self, source: &Path) -> Result<Run<'_>> {
        let run_open = |e: rusqlite::Error| Error::RunOpen {
            path: source.to_path_buf(),
            source: e,
        };

        let ifc_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.display().to_string());

        let tx = self.conn.transaction().map_err(run_open)?;
        let run_id: i64 = tx
            .query_row(
                "INSERT INTO ifc_run (ifc_name, ifc_hash) VALUES (?1, NULL) RETURNING run_id",
                params![ifc_name],
                |row| row.get(0),
            )
            .map_err(run_open)?;

        info!("run {} opened for {}", run_id, ifc_name);

        Ok(Run {
            tx,
            run_id,
            options: self.options.clone(),
            materials: MaterialCache::default(),
        })
    }
}

/// Fingerprint -> persisted material id, for one run.
#[derive(Debug, Default)]
pub struct MaterialCache {
    ids: HashMap<Fingerprint, i64>,
}

impl MaterialCache {
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<i64> {
        self.ids.get(fingerprint).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn insert(&mut self, fingerprint: Fingerprint, id: i64) {
        self.ids.entry(fingerprint).or_insert(id);
    }
}

/// One processing pass over one source file.
pub struct Run<'conn> {
    tx: Transaction<'conn>,
    run_id: i64,
    options: StoreOptions,
    materials: MaterialCache,
}

impl<'conn> Run<'conn> {
    pub fn id(&self) -> i64 {
        self.run_id
    }

    pub fn material_cache(&self) -> &MaterialCache {
        &self.materials
    }

    pub fn upsert_material<S: MaterialSource + ?Sized>(&mut self, source: &S) -> Result<i64> {
        let material = Material::resolve(source);
        let fingerprint = material.fingerprint();
        if let Some(id) = self.materials.get(&fingerprint) {
            return Ok(id);
        }

        let rgba = serde_json::to_string(&material.rgba)?;
        let extras = serde_json::to_string(&material.extras)?;

        let id: i64 = self.tx.query_row(
            "INSERT INTO ifc_material (basecolor_hex, rgba, extras, fingerprint)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (fingerprint) DO UPDATE
             SET basecolor_hex = excluded.basecolor_hex,
                 rgba = excluded.rgba,
                 extras = excluded.extras
             RETURNING material_id",
            params![material.hex(), rgba, extras, fingerprint.as_str()],
            |row| row.get(0),
        )?;

        debug!("material {} -> id {}", material.hex(), id);
        self.materials.insert(fingerprint, id);
        Ok(id)
    }

    pub fn upsert_object(
        &self,
        guid: &str,
        class: &str,
        group: &str,
        space: &str,
        attributes: &Attributes,
        centroid: Point,
    ) -> Result<()> {
        let props = serde_json::to_string(attributes)?;

        self.tx.execute(
            "INSERT INTO ifc_object (guid, run_id, ifc_class, ifc_group, ifc_space, props, centroid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (guid) DO UPDATE
             SET run_id = excluded.run_id,
                 ifc_class = excluded.ifc_class,
                 ifc_group = excluded.ifc_group,
                 ifc_space = excluded.ifc_space,
                 props = excluded.props,
                 centroid = excluded.centroid",
            params![
                guid,
                self.run_id,
                class,
                group,
                space,
                props,
                point_ewkt(centroid, self.options.srid)
            ],
        )?;
        Ok(())
    }

    /// Stores the packed triangles; the polyhedral surface only when enabled.
    /// An existing surface is kept when this write carries none.
    pub fn upsert_mesh(&self, guid: &str, triangles: &[Triangle], shaders: Option<&Value>) -> Result<()> {
        let blob = encode_triangles(triangles);
        let geom = self
            .options
            .write_geometry
            .then(|| polyhedral_surface_ewkt(triangles, self.options.srid));
        let shaders = shaders.map(serde_json::to_string).transpose()?;
        let meta = serde_json::to_string(&blob.meta)?;

        self.tx.execute(
            "INSERT INTO ifc_mesh (guid, geom, triangles_blob, triangles_count, shaders, extras)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (guid) DO UPDATE
             SET geom = COALESCE(excluded.geom, ifc_mesh.geom),
                 triangles_blob = excluded.triangles_blob,
                 triangles_count = excluded.triangles_count,
                 shaders = excluded.shaders,
                 extras = excluded.extras",
            params![guid, geom, blob.bytes, blob.triangle_count as i64, shaders, meta],
        )?;
        Ok(())
    }

    /// Parts resolving to the same material row are merged into one.
    pub fn upsert_material_parts(&mut self, guid: &str, parts: &[MaterialPart]) -> Result<()> {
        let mut faces_by_material: IndexMap<i64, BTreeSet<usize>> = IndexMap::new();
        for part in parts {
            let material_id = self.upsert_material(&part.material)?;
            faces_by_material
                .entry(material_id)
                .or_default()
                .extend(part.face_indices.iter().copied());
        }

        for (material_id, faces) in faces_by_material {
            let faces = serde_json::to_string(&faces)?;
            self.tx.execute(
                "INSERT INTO ifc_object_material_part (guid, material_id, face_indices)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (guid, material_id) DO UPDATE
                 SET face_indices = excluded.face_indices",
                params![guid, material_id, faces],
            )?;
        }
        Ok(())
    }

    /// Object row, material parts and mesh for one element.
    pub fn save_element(&mut self, element: &Element) -> Result<()> {
        self.upsert_object(
            element.id(),
            element.class(),
            element.group(),
            element.space(),
            element.attributes(),
            element.centroid(),
        )?;

        if !element.parts().is_empty() {
            self.upsert_material_parts(element.id(), element.parts())?;
        }

        let colors = expand_shader_colors(
            element.triangle_count(),
            element.parts(),
            &self.options.default_hex,
        );
        self.upsert_mesh(element.id(), element.triangles(), Some(&shader_document(colors)))
    }

    /// Commit everything written in this run.
    pub fn close(self) -> Result<()> {
        let run_id = self.run_id;
        let materials = self.materials.len();
        self.tx.commit()?;
        info!("run {} committed ({} materials)", run_id, materials);
        Ok(())
    }
}

/// Stored geometry of one mesh row, if any.
pub fn stored_geometry(conn: &Connection, guid: &str) -> Result<Option<String>> {
    let geom: Option<Option<String>> = conn
        .query_row("SELECT geom FROM ifc_mesh WHERE guid = ?1", params![guid], |row| row.get(0))
        .optional()?;
    Ok(geom.flatten())
}
