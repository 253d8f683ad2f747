use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{AdapterCatalog, GenerationError, Pipeline, Result};

/// File name diffusers writes LoRA weights to; preferred inside a directory.
const PREFERRED_WEIGHTS: &str = "pytorch_lora_weights.safetensors";
const WEIGHTS_EXTENSION: &str = "safetensors";

/// A LoRA adapter resolved to its weights file, with its blend scale.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct AdapterBinding {
    /// The identifier the caller asked for.
    pub name: String,
    pub weights: PathBuf,
    /// Blend weight. 0.0 disables, 1.0 is nominal, above 1.5 tends to
    /// produce artifacts. Not clamped.
    pub scale: f64,
}

/// Resolves a LoRA name or path to its weights file.
///
/// Lookup order: bundled catalog entry, `<root>/<name>/`, then `name` as a
/// filesystem path. Returns `Ok(None)` when no adapter was requested.
pub fn resolve_adapter(
    name_or_path: Option<&str>,
    scale: f64,
    catalog: &AdapterCatalog,
) -> Result<Option<AdapterBinding>> {
    let Some(name) = name_or_path.map(str::trim).filter(|n| is_requested(n)) else {
        return Ok(None);
    };
    if !scale.is_finite() {
        return Err(GenerationError::config(format!(
            "lora scale must be a finite number, got {scale}"
        )));
    }

    let mut candidates = Vec::with_capacity(3);
    if let Some(bundled) = catalog.bundled.get(name) {
        candidates.push(bundled.clone());
    }
    candidates.push(catalog.root.join(name));
    candidates.push(PathBuf::from(name));

    for candidate in &candidates {
        if let Some(weights) = weights_in(candidate) {
            info!("using adapter '{name}' from {} (scale {scale})", weights.display());
            return Ok(Some(AdapterBinding {
                name: name.to_string(),
                weights,
                scale,
            }));
        }
        debug!("adapter '{name}' not found at {}", candidate.display());
    }

    Err(GenerationError::AdapterNotFound {
        name: name.to_string(),
        searched: candidates,
    })
}

/// The UI lists "None" as the no-adapter choice.
fn is_requested(name: &str) -> bool {
    !name.is_empty() && !name.eq_ignore_ascii_case("none")
}

/// The weights file at `path`: the file itself, or the preferred (else
/// first by name) safetensors file of a directory.
fn weights_in(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return is_weights_file(path).then(|| path.to_path_buf());
    }
    if !path.is_dir() {
        return None;
    }

    let preferred = path.join(PREFERRED_WEIGHTS);
    if preferred.is_file() {
        return Some(preferred);
    }
    let mut files: Vec<PathBuf> = fs::read_dir(path)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_weights_file(p))
        .collect();
    files.sort();
    files.into_iter().next()
}

fn is_weights_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(WEIGHTS_EXTENSION))
}

/// Attaches a resolved adapter to a loaded pipeline.
pub fn attach_adapter<P: Pipeline + ?Sized>(
    pipeline: &mut P,
    binding: &AdapterBinding,
) -> Result<()> {
    if !pipeline.supports_adapter() {
        return Err(GenerationError::Adapter {
            name: binding.name.clone(),
            source: anyhow::anyhow!("the pipeline does not support LoRA adapters"),
        });
    }
    pipeline
        .attach_adapter(binding)
        .map_err(|source| GenerationError::Adapter {
            name: binding.name.clone(),
            source,
        })
}

/// Names a caller can pick from: bundled adapters and every directory
/// under the adapters root, sorted.
pub fn list_adapters(catalog: &AdapterCatalog) -> Vec<String> {
    let mut names: BTreeSet<String> = catalog.bundled.keys().cloned().collect();
    if let Ok(entries) = fs::read_dir(&catalog.root) {
        names.extend(
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().is_dir())
                .map(|entry| entry.file_name().to_string_lossy().into_owned()),
        );
    }
    names.into_iter().collect()
}
