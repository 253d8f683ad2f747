use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ResolvedGeometry;

pub const DEFAULT_MODEL: &str = "black-forest-labs/FLUX.1-schnell";
pub const DEFAULT_PROMPT: &str = "Analog film portrait of a skateboarder, shallow depth of field";

/// Defaults and catalogs a front end injects into the orchestrator.
///
/// Every field is optional in the TOML form:
///
/// ```toml
/// model = "black-forest-labs/FLUX.1-dev"
/// output_dir = "renders"
///
/// [adapters]
/// root = "loras"
///
/// [adapters.bundled]
/// film = "/opt/lumen/loras/film"
/// ```
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub model: String,
    pub default_prompt: String,
    pub default_geometry: ResolvedGeometry,
    pub output_dir: PathBuf,
    pub adapters: AdapterCatalog,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            default_prompt: DEFAULT_PROMPT.to_string(),
            default_geometry: ResolvedGeometry::default(),
            output_dir: PathBuf::from("output"),
            adapters: AdapterCatalog::default(),
        }
    }
}

impl Settings {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse settings {}", path.display()))
    }

    /// Settings from `path` when given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_toml_file(path),
            None => Ok(Self::default()),
        }
    }
}

/// Where LoRA adapters are looked up.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AdapterCatalog {
    /// Directory holding one subdirectory per adapter.
    pub root: PathBuf,
    /// Adapters shipped with the installation, by name.
    pub bundled: BTreeMap<String, PathBuf>,
}

impl Default for AdapterCatalog {
    fn default() -> Self {
        Self {
            root: PathBuf::from("loras"),
            bundled: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let settings: Settings = toml::from_str(
            r#"
            output_dir = "renders"

            [default_geometry]
            width = 768
            height = 512

            [adapters.bundled]
            film = "/opt/loras/film"
            "#,
        )
        .unwrap();

        assert_eq!(settings.output_dir, PathBuf::from("renders"));
        assert_eq!(settings.default_geometry, ResolvedGeometry { width: 768, height: 512 });
        assert_eq!(settings.adapters.root, PathBuf::from("loras"));
        assert_eq!(settings.adapters.bundled["film"], PathBuf::from("/opt/loras/film"));
        assert_eq!(settings.model, DEFAULT_MODEL);
    }

    #[test]
    fn load_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lumen.toml");
        std::fs::write(&path, "model = \"black-forest-labs/FLUX.1-dev\"\n").unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.model, "black-forest-labs/FLUX.1-dev");
        assert!(Settings::load(Some(&tmp.path().join("missing.toml"))).is_err());
    }
}
