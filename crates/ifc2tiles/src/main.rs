mod config;

use std::time::Instant;

use anyhow::{Context, Result};
use bimtile::tileset::write_manifest;
use bimtile::{FileOutput, Tiler};
use clap::Parser;
use log::info;

use crate::config::Config;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    let start = Instant::now();

    let tiler_options = config.tiler_options();
    info!("options: {}", serde_json::to_string(&tiler_options)?);

    let mut tiler = Tiler::new(tiler_options);
    if let Some(db) = &config.db {
        let store_options = config.store_options();
        info!("store {}: {}", db.display(), serde_json::to_string(&store_options)?);
        tiler = tiler.with_store(db, store_options);
    }

    // Input and store failures end the batch; per-file failures are logged.
    let outputs: Vec<FileOutput> = tiler.run(&config.paths).context("preparing the batch")?;

    let manifest = write_manifest(&outputs, &config.output_dir)
        .with_context(|| format!("writing manifest into {}", config.output_dir.display()))?;

    let elements: usize = outputs.iter().map(FileOutput::element_count).sum();
    info!(
        "{} files, {} elements -> {} in {:.2?}",
        outputs.len(),
        elements,
        manifest.display(),
        start.elapsed()
    );

    Ok(())
}
