use serde::{Deserialize, Serialize};

use crate::{GenerationError, Result};

/// Pixel dimensions must be a multiple of this for the latent packing.
pub const DIMENSION_MULTIPLE: usize = 16;
/// Largest accepted width or height (2K).
pub const MAX_DIMENSION: usize = 2048;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aspect {
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "4:3")]
    Classic,
    #[serde(rename = "3:4")]
    ClassicPortrait,
    #[serde(rename = "custom")]
    Custom,
}

serde_plain::derive_fromstr_from_deserialize!(Aspect);
serde_plain::derive_display_from_serialize!(Aspect);

impl Aspect {
    pub const PRESETS: [Aspect; 5] = [
        Aspect::Square,
        Aspect::Landscape,
        Aspect::Portrait,
        Aspect::Classic,
        Aspect::ClassicPortrait,
    ];

    /// Canonical geometry of a preset, `None` for `custom`.
    ///
    /// Presets keep the pixel count close to one megapixel.
    pub fn preset(self) -> Option<ResolvedGeometry> {
        let (width, height) = match self {
            Aspect::Square => (1024, 1024),
            Aspect::Landscape => (1280, 720),
            Aspect::Portrait => (720, 1280),
            Aspect::Classic => (1088, 816),
            Aspect::ClassicPortrait => (816, 1088),
            Aspect::Custom => return None,
        };
        Some(ResolvedGeometry { width, height })
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolvedGeometry {
    pub width: usize,
    pub height: usize,
}

impl Default for ResolvedGeometry {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
        }
    }
}

impl std::fmt::Display for ResolvedGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Rounds to the nearest multiple of 16. Half-multiples round up.
/// `None` when the rounded value does not fit in `usize`.
pub fn round_dimension(value: usize) -> Option<usize> {
    let rounded = value.checked_add(DIMENSION_MULTIPLE / 2)? / DIMENSION_MULTIPLE;
    rounded.checked_mul(DIMENSION_MULTIPLE)
}

/// Resolves the target geometry of a run from a preset or explicit dimensions.
///
/// A preset combined with explicit dimensions is accepted only when the
/// dimensions agree with the preset after rounding. Without a preset, a
/// missing dimension falls back to `default`.
pub fn resolve_geometry(
    aspect: Option<Aspect>,
    height: Option<usize>,
    width: Option<usize>,
    default: ResolvedGeometry,
) -> Result<ResolvedGeometry> {
    let height = height.map(|h| checked_dimension("height", h)).transpose()?;
    let width = width.map(|w| checked_dimension("width", w)).transpose()?;

    if let Some(preset) = aspect.and_then(Aspect::preset) {
        let conflicts =
            height.is_some_and(|h| h != preset.height) || width.is_some_and(|w| w != preset.width);
        if conflicts {
            return Err(GenerationError::config(format!(
                "aspect {} is {preset}, which conflicts with the explicit size {}x{}; \
                 use --aspect custom to set dimensions",
                aspect.map(|a| a.to_string()).unwrap_or_default(),
                width.unwrap_or(preset.width),
                height.unwrap_or(preset.height),
            )));
        }
        return Ok(preset);
    }

    Ok(ResolvedGeometry {
        width: match width {
            Some(width) => width,
            None => checked_dimension("default width", default.width)?,
        },
        height: match height {
            Some(height) => height,
            None => checked_dimension("default height", default.height)?,
        },
    })
}

fn checked_dimension(name: &str, value: usize) -> Result<usize> {
    if value > MAX_DIMENSION {
        return Err(GenerationError::config(format!(
            "{name} {value} is too large, the maximum is {MAX_DIMENSION}"
        )));
    }
    match round_dimension(value) {
        Some(rounded) if rounded > 0 => Ok(rounded),
        _ => Err(GenerationError::config(format!(
            "{name} {value} is too small, it must round to at least {DIMENSION_MULTIPLE}"
        ))),
    }
}
