use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::seed::deserialize_seed;
use crate::{Aspect, AttentionBackend, DeviceChoice, GenerationError, Result};

pub const MIN_STEPS: usize = 1;
pub const MAX_STEPS: usize = 20;
pub const DEFAULT_STEPS: usize = 9;
/// Images per request. Seeds and outcomes are held in memory for the batch.
pub const MAX_IMAGES: usize = 32;

/// A normalized generation request, as produced by the CLI or HTTP front end.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub steps: usize,
    pub guidance_scale: f64,
    pub aspect: Option<Aspect>,
    pub height: Option<usize>,
    pub width: Option<usize>,
    /// Absent or 0 means a random seed per image.
    #[serde(deserialize_with = "deserialize_seed")]
    pub seed: Option<u64>,
    pub num_images: usize,
    pub device: DeviceChoice,
    pub attention_backend: AttentionBackend,
    pub compile: bool,
    /// Only applies when the run resolves to a cuda device.
    pub cpu_offload: bool,
    /// Adapter name or path.
    pub lora: Option<String>,
    pub lora_scale: f64,
    /// Output file or directory.
    pub output: Option<String>,
    pub outdir: Option<PathBuf>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: None,
            steps: DEFAULT_STEPS,
            guidance_scale: 0.0,
            aspect: None,
            height: None,
            width: None,
            seed: None,
            num_images: 1,
            device: DeviceChoice::Auto,
            attention_backend: AttentionBackend::Sdpa,
            compile: false,
            cpu_offload: false,
            lora: None,
            lora_scale: 1.0,
            output: None,
            outdir: None,
        }
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Checks the options that do not depend on the machine or filesystem.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(GenerationError::config("prompt must not be empty"));
        }
        if !(MIN_STEPS..=MAX_STEPS).contains(&self.steps) {
            return Err(GenerationError::config(format!(
                "steps must be between {MIN_STEPS} and {MAX_STEPS}, got {}",
                self.steps
            )));
        }
        if !(1..=MAX_IMAGES).contains(&self.num_images) {
            return Err(GenerationError::config(format!(
                "num_images must be between 1 and {MAX_IMAGES}, got {}",
                self.num_images
            )));
        }
        if !self.guidance_scale.is_finite() {
            return Err(GenerationError::config("guidance_scale must be a finite number"));
        }
        Ok(())
    }

    /// The negative prompt, if it has any content.
    pub fn negative_prompt(&self) -> Option<&str> {
        self.negative_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}
