//! Per-file driver: load, group, build hierarchies, persist.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use log::{error, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::group::GroupCollection;
use crate::grouping::GroupingStrategy;
use crate::hierarchy::HierarchyTable;
use crate::input::{discover, valid_inputs};
use crate::kernel::{GeometryKernel, JsonModel};
use crate::store::{Store, StoreOptions};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilerOptions {
    pub grouping: GroupingStrategy,
    /// Build a [`HierarchyTable`] for every collection.
    pub with_hierarchy: bool,
}

/// What one source file produced.
#[derive(Debug, Clone)]
pub struct FileOutput {
    pub source: PathBuf,
    /// Non-empty collections in creation order.
    pub groups: Vec<GroupCollection>,
    /// Same order as `groups`; `None` unless hierarchies were requested.
    pub hierarchies: Option<Vec<HierarchyTable>>,
    /// Elements written to the store.
    pub persisted: usize,
}

impl FileOutput {
    pub fn element_count(&self) -> usize {
        self.groups.iter().map(GroupCollection::len).sum()
    }
}

#[derive(Debug, Default)]
pub struct Tiler {
    options: TilerOptions,
    store: Option<(PathBuf, StoreOptions)>,
    /// SQLite takes one writer at a time; files persist one after another.
    persist_lock: Mutex<()>,
}

impl Tiler {
    pub fn new(options: TilerOptions) -> Self {
        Self {
            options,
            store: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Persist every processed file into the SQLite database at `path`.
    pub fn with_store(mut self, path: impl Into<PathBuf>, options: StoreOptions) -> Self {
        self.store = Some((path.into(), options));
        self
    }

    pub fn options(&self) -> &TilerOptions {
        &self.options
    }

    pub fn process_file(&self, path: &Path) -> Result<FileOutput> {
        let start = Instant::now();
        info!("processing {}", path.display());

        let model = JsonModel::open(path)?;
        if let Some(schema) = model.schema() {
            info!("{}: schema {}", path.display(), schema);
        }

        let output = self.process_model(path, &model)?;
        info!(
            "{}: {} groups, {} elements in {:.2?}",
            path.display(),
            output.groups.len(),
            output.element_count(),
            start.elapsed()
        );
        Ok(output)
    }

    /// Group an already loaded model. The store run, when configured, covers
    /// the whole model and is rolled back on the first persistence failure.
    pub fn process_model<K: GeometryKernel + ?Sized>(&self, source: &Path, kernel: &K) -> Result<FileOutput> {
        let groups = self
            .options
            .grouping
            .collect(kernel, self.options.with_hierarchy);

        let hierarchies = self
            .options
            .with_hierarchy
            .then(|| groups.iter().map(GroupCollection::hierarchy).collect());

        let persisted = match &self.store {
            Some((db, options)) => {
                let _guard = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
                persist(db, options, source, &groups)?
            }
            None => 0,
        };

        Ok(FileOutput {
            source: source.to_path_buf(),
            groups,
            hierarchies,
            persisted,
        })
    }

    /// Open the configured store once, creating its schema. A store that
    /// cannot be opened ends the whole batch.
    pub fn prepare_store(&self) -> Result<()> {
        if let Some((db, options)) = &self.store {
            Store::open(db, options.clone())?;
            info!("store ready at {}", db.display());
        }
        Ok(())
    }

    /// Discover inputs and process them in parallel, one file per task.
    ///
    /// Fails when no input is usable or the store cannot be opened, before
    /// any file is grouped. A failing file is logged and left out. Outputs
    /// keep input order.
    pub fn run<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<FileOutput>> {
        let files = valid_inputs(&discover(paths))?;
        self.prepare_store()?;

        let outputs: Vec<FileOutput> = files
            .par_iter()
            .filter_map(|file| match self.process_file(file) {
                Ok(output) => Some(output),
                Err(err) => {
                    error!("[FAIL] {}: {}", file.display(), err);
                    None
                }
            })
            .collect();

        info!("{} / {} files processed", outputs.len(), files.len());
        Ok(outputs)
    }
}

fn persist(db: &Path, options: &StoreOptions, source: &Path, groups: &[GroupCollection]) -> Result<usize> {
    let mut store = Store::open(db, options.clone())?;
    let mut run = store.open_run(source)?;

    let mut saved = 0;
    for placed in groups.iter().flat_map(GroupCollection::elements) {
        run.save_element(&placed.element)?;
        saved += 1;
    }

    run.close()?;
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;

    fn export() -> serde_json::Value {
        let tri = json!({
            "verts": [0, 0, 0, 1, 0, 0, 0, 1, 0],
            "faces": [0, 1, 2],
            "materials": [ { "diffuse": [0.2, 0.4, 0.6] } ]
        });
        json!({
            "schema": "IFC4",
            "entities": [
                { "id": 1, "global_id": "B1", "class": "IfcBuilding", "kind": "building" },
                { "id": 2, "global_id": "L1", "class": "IfcBuildingStorey", "kind": "spatial", "decomposes": [1] },
                { "id": 3, "global_id": "W1", "class": "IfcWall", "container": 2, "representation": tri },
                { "id": 4, "global_id": "W2", "class": "IfcWall", "container": 2, "representation": tri },
                { "id": 5, "global_id": "D1", "class": "IfcDoor", "container": 2, "representation": tri }
            ]
        })
    }

    fn count(db: &Path, table: &str) -> i64 {
        let conn = rusqlite::Connection::open(db).unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn a_file_is_grouped_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("office.json");
        std::fs::write(&model, export().to_string()).unwrap();
        let db = dir.path().join("ifc.sqlite");

        let tiler = Tiler::new(TilerOptions {
            grouping: GroupingStrategy::ByType,
            with_hierarchy: true,
        })
        .with_store(&db, StoreOptions::default());

        let output = tiler.process_file(&model).unwrap();
        let keys: Vec<_> = output.groups.iter().map(|g| g.key()).collect();
        assert_eq!(keys, vec!["IfcWall@B1", "IfcDoor@B1"]);
        assert_eq!(output.element_count(), 3);
        assert_eq!(output.persisted, 3);

        let hierarchies = output.hierarchies.as_ref().unwrap();
        assert_eq!(hierarchies.len(), 2);
        assert_eq!(hierarchies[0].position("L1"), Some(2));
        assert_eq!(hierarchies[0].position("B1"), Some(3));

        assert_eq!(count(&db, "ifc_object"), 3);
        assert_eq!(count(&db, "ifc_material"), 1);
        assert_eq!(count(&db, "ifc_object_material_part"), 3);

        // Processing the same file again updates rows in place.
        tiler.process_file(&model).unwrap();
        assert_eq!(count(&db, "ifc_object"), 3);
        assert_eq!(count(&db, "ifc_run"), 2);
    }

    #[test]
    fn a_broken_file_does_not_stop_its_siblings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a_broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("b_office.json"), export().to_string()).unwrap();

        let outputs = Tiler::new(TilerOptions::default()).run(&[dir.path()]).unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].source.ends_with("b_office.json"));
        assert!(outputs[0].hierarchies.is_none());
        assert_eq!(outputs[0].persisted, 0);
    }

    #[test]
    fn an_unopenable_store_ends_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("office.json");
        std::fs::write(&model, export().to_string()).unwrap();

        let tiler = Tiler::new(TilerOptions::default())
            .with_store(dir.path().join("no/such/dir/ifc.sqlite"), StoreOptions::default());
        assert!(matches!(tiler.prepare_store(), Err(Error::Persistence(_))));
        assert!(matches!(tiler.run(&[&model]), Err(Error::Persistence(_))));
    }

    #[test]
    fn parallel_files_all_reach_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = dir.path().join("models");
        std::fs::create_dir(&inputs).unwrap();
        for i in 0..6 {
            std::fs::write(inputs.join(format!("part_{i}.json")), export().to_string()).unwrap();
        }
        let db = dir.path().join("ifc.sqlite");

        let outputs = Tiler::new(TilerOptions::default())
            .with_store(&db, StoreOptions::default())
            .run(&[&inputs])
            .unwrap();

        assert_eq!(outputs.len(), 6);
        assert!(outputs[0].source.ends_with("part_0.json"));
        assert!(outputs.iter().all(|o| o.persisted == 3));
        assert_eq!(count(&db, "ifc_run"), 6);
        assert_eq!(count(&db, "ifc_object"), 3);
    }

    #[test]
    fn zero_valid_inputs_fail_before_grouping() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let err = Tiler::new(TilerOptions::default()).run(&[missing]).unwrap_err();
        assert!(matches!(err, Error::NoValidInput { total: 1 }));
    }
}
