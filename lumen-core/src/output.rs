use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use anyhow::Context;
use image::{DynamicImage, ImageFormat};

use crate::{GenerationError, Result};

const SYNTHESIZED_PREFIX: &str = "image";
const SYNTHESIZED_EXTENSION: &str = "png";

/// Timestamp shared by every synthesized file name of one run.
pub fn run_stamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Computes where image `index` of `total` is written, creating parent
/// directories as needed.
///
/// `hint` is a file or directory. It is a directory when it ends with a
/// separator, already exists as a directory, or has no extension. Without a
/// hint images go to `outdir`, else `default_dir`, under synthesized names.
pub fn resolve_output_path(
    hint: Option<&str>,
    outdir: Option<&Path>,
    default_dir: &Path,
    index: usize,
    total: usize,
    stamp: &str,
) -> Result<PathBuf> {
    let hint = hint.map(str::trim).filter(|h| !h.is_empty());

    let path = match hint {
        Some(hint) if is_directory_hint(hint) => {
            let dir = Path::new(hint);
            ensure_dir(dir)?;
            synthesized_path(dir, index, total, stamp)
        }
        Some(hint) => {
            let file = Path::new(hint);
            let target = if total > 1 {
                indexed_sibling(file, index)
            } else {
                file.to_path_buf()
            };
            if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
                ensure_dir(parent)?;
            }
            target
        }
        None => {
            let dir = outdir.unwrap_or(default_dir);
            ensure_dir(dir)?;
            synthesized_path(dir, index, total, stamp)
        }
    };
    Ok(path)
}

fn is_directory_hint(hint: &str) -> bool {
    hint.ends_with('/')
        || hint.ends_with(MAIN_SEPARATOR)
        || Path::new(hint).is_dir()
        || Path::new(hint).extension().is_none()
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|err| GenerationError::io(dir, err))
}

/// `pic.png` -> `pic_1.png`
fn indexed_sibling(file: &Path, index: usize) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| SYNTHESIZED_PREFIX.to_string());
    let name = match file.extension() {
        Some(ext) => format!("{stem}_{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index}"),
    };
    file.with_file_name(name)
}

fn synthesized_path(dir: &Path, index: usize, total: usize, stamp: &str) -> PathBuf {
    let base = if total > 1 {
        format!("{SYNTHESIZED_PREFIX}_{stamp}_{index}")
    } else {
        format!("{SYNTHESIZED_PREFIX}_{stamp}")
    };
    let mut path = dir.join(format!("{base}.{SYNTHESIZED_EXTENSION}"));
    // Runs started within the same second would otherwise overwrite each other.
    let mut counter = 1;
    while path.exists() {
        path = dir.join(format!("{base}-{counter}.{SYNTHESIZED_EXTENSION}"));
        counter += 1;
    }
    path
}

/// Encodes `image` next to `path` and renames it into place, so an
/// interrupted write never leaves a partial file at `path`.
pub fn write_image_atomic(image: &DynamicImage, path: &Path) -> anyhow::Result<()> {
    let format = ImageFormat::from_path(path)
        .with_context(|| format!("unsupported image extension for {}", path.display()))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::Builder::new()
        .prefix(".lumen-")
        .suffix(".part")
        .tempfile_in(dir)
        .with_context(|| format!("failed to create a temporary file in {}", dir.display()))?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        image
            .write_to(&mut writer, format)
            .with_context(|| format!("failed to encode {}", path.display()))?;
        writer.flush()?;
    }
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move image into {}", path.display()))?;
    Ok(())
}
