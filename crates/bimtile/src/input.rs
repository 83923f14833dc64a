use std::path::{Path, PathBuf};

use log::{error, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Kernel export formats the tiler can open.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["json", "zip"];

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.iter().any(|s| ext.eq_ignore_ascii_case(s)))
        .unwrap_or(false)
}

/// Expand directories into the supported exports they contain (sorted);
/// other paths are passed through for [`valid_inputs`] to judge.
pub fn discover<P: AsRef<Path>>(paths: &[P]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for path in paths {
        let path = path.as_ref();
        if !path.is_dir() {
            files.push(path.to_path_buf());
            continue;
        }

        let mut found: Vec<PathBuf> = WalkDir::new(path)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|p| is_supported(p))
            .collect();
        found.sort();
        files.extend(found);
    }

    files
}

/// Keep the paths that exist and are regular files.
pub fn valid_inputs(files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut valid = Vec::with_capacity(files.len());

    for path in files {
        if !path.exists() {
            error!("[SKIP] not found: {}", path.display());
            continue;
        }
        if !path.is_file() {
            error!("[SKIP] not a file: {}", path.display());
            continue;
        }
        valid.push(path.clone());
    }

    if valid.is_empty() {
        return Err(Error::NoValidInput { total: files.len() });
    }

    info!("valid files: {} / total: {}", valid.len(), files.len());
    Ok(valid)
}
