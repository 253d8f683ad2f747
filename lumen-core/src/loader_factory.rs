use anyhow::{anyhow, Result};
use tracing::info;

use crate::{FluxLoader, FluxVariant};

/// Model families with a pipeline implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Flux(FluxVariant),
}

impl ModelVariant {
    /// Detect model variant from a model name such as a hub repo id.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(ModelVariant::Flux(if name_upper.contains("DEV") {
                FluxVariant::Dev
            } else {
                // Schnell unless stated otherwise
                FluxVariant::Schnell
            }))
        } else {
            None
        }
    }
}

/// Builds the loader for a model name, detecting the variant from it.
pub fn loader_for_model(model_name: &str) -> Result<FluxLoader> {
    let variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model: {}", model_name))?;
    info!("using model {model_name} (detected variant: {variant:?})");

    match variant {
        ModelVariant::Flux(flux_variant) => FluxLoader::new(flux_variant),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_flux_variants() {
        assert_eq!(
            ModelVariant::from_name("black-forest-labs/FLUX.1-schnell"),
            Some(ModelVariant::Flux(FluxVariant::Schnell))
        );
        assert_eq!(
            ModelVariant::from_name("black-forest-labs/FLUX.1-dev"),
            Some(ModelVariant::Flux(FluxVariant::Dev))
        );
        assert_eq!(
            ModelVariant::from_name("flux"),
            Some(ModelVariant::Flux(FluxVariant::Schnell))
        );
    }

    #[test]
    fn rejects_other_models() {
        assert_eq!(ModelVariant::from_name("stabilityai/sdxl-turbo"), None);
        assert!(loader_for_model("stabilityai/sdxl-turbo").is_err());
    }
}
