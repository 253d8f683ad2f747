use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::clip::text_model::{
    Activation, ClipTextConfig, ClipTextTransformer,
};
use candle_transformers::models::flux::{autoencoder, model, sampling};
use candle_transformers::models::t5::{self, T5EncoderModel};
use hf_hub::api::sync::Api;
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::lora::LoraAdapter;
use crate::{
    dtype_of, open_device, probe_environment, tensor_to_image, AdapterBinding,
    EnvironmentSnapshot, Loader, Pipeline, PipelineInput, ResolvedDevice, ResolvedGeometry,
};

/// Channels of the FLUX latent space.
const LATENT_CHANNELS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    fn repo(self) -> &'static str {
        match self {
            Self::Schnell => "black-forest-labs/FLUX.1-schnell",
            Self::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    fn transformer_file(self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }

    fn model_config(self) -> model::Config {
        match self {
            Self::Schnell => model::Config::schnell(),
            Self::Dev => model::Config::dev(),
        }
    }

    fn autoencoder_config(self) -> autoencoder::Config {
        match self {
            Self::Schnell => autoencoder::Config::schnell(),
            Self::Dev => autoencoder::Config::dev(),
        }
    }

    fn t5_max_tokens(self) -> usize {
        match self {
            Self::Schnell => 256,
            Self::Dev => 512,
        }
    }

    /// Dev shifts its schedule towards high noise for large images.
    fn schedule_shift(self, image_seq_len: usize) -> Option<(usize, f64, f64)> {
        match self {
            Self::Schnell => None,
            Self::Dev => Some((image_seq_len, 0.5, 1.15)),
        }
    }
}

/// Local paths of every weight and tokenizer file the pipeline uses.
#[derive(Debug, Clone)]
struct WeightFiles {
    t5_model: PathBuf,
    t5_config: PathBuf,
    t5_tokenizer: PathBuf,
    clip_model: PathBuf,
    clip_tokenizer: PathBuf,
    autoencoder: PathBuf,
    transformer: PathBuf,
}

/// T5 and CLIP prompt encoders, possibly on a different device than the
/// transformer.
struct TextEncoders {
    device: Device,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
}

impl TextEncoders {
    fn load(files: &WeightFiles, device: &Device, dtype: DType) -> Result<Self> {
        // --- T5 model and tokenizer ---
        let t5_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.t5_model], dtype, device)
                .context("failed to build T5 var builder")?
        };
        let config_str =
            std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = Tokenizer::from_file(&files.t5_tokenizer)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- CLIP model and tokenizer ---
        let clip_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.clip_model], dtype, device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer = Tokenizer::from_file(&files.clip_tokenizer)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        Ok(Self {
            device: device.clone(),
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
        })
    }

    /// T5 and CLIP embeddings of `prompt`, moved to `device` as `dtype`.
    fn encode(
        &mut self,
        prompt: &str,
        t5_max_tokens: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<(Tensor, Tensor)> {
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(t5_max_tokens, 0);
        let t5_input = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&t5_input)?;

        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let clip_input = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&clip_input)?;

        Ok((
            t5_emb.to_device(device)?.to_dtype(dtype)?,
            clip_emb.to_device(device)?.to_dtype(dtype)?,
        ))
    }
}

/// Standard normal latent noise drawn on the host from `seed`, so a seed
/// gives the same image on every device.
fn seeded_noise(seed: u64, geometry: ResolvedGeometry, device: &Device) -> Result<Tensor> {
    let height = geometry.height.div_ceil(16) * 2;
    let width = geometry.width.div_ceil(16) * 2;
    let len = LATENT_CHANNELS * height * width;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(len + 1);
    while values.len() < len {
        // Box-Muller
        let u1 = 1.0 - rng.gen::<f32>();
        let u2 = rng.gen::<f32>();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = std::f32::consts::TAU * u2;
        values.push(radius * theta.cos());
        values.push(radius * theta.sin());
    }
    values.truncate(len);
    Ok(Tensor::from_vec(
        values,
        (1, LATENT_CHANNELS, height, width),
        device,
    )?)
}

pub struct FluxPipeline {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    files: WeightFiles,
    encoders: TextEncoders,
    autoencoder: autoencoder::AutoEncoder,
    /// Empty only while the transformer is being rebuilt.
    flux_model: Option<model::Flux>,
}

/// Transformer weights with the adapter merged in, held in host memory.
fn merged_transformer_weights(
    transformer: &Path,
    adapter: &AdapterBinding,
) -> Result<HashMap<String, Tensor>> {
    let lora = LoraAdapter::load(&adapter.weights, &Device::Cpu)?;
    let mut weights = candle_core::safetensors::load(transformer, &Device::Cpu)
        .context("failed to load transformer weights")?;
    let merged = lora.merge_into(&mut weights, adapter.scale)?;
    info!(
        "merged {merged} LoRA layers from {} at scale {}",
        adapter.weights.display(),
        adapter.scale
    );
    Ok(weights)
}

impl Pipeline for FluxPipeline {
    fn generate(&mut self, input: &PipelineInput<'_>) -> Result<DynamicImage> {
        let ResolvedGeometry { width, height } = input.geometry;
        if input.negative_prompt.is_some() {
            debug!("negative prompt ignored, FLUX models are guidance distilled");
        }

        // --- Noise, prompt embeddings, schedule ---
        let noise = seeded_noise(input.seed, input.geometry, &self.device)?.to_dtype(self.dtype)?;
        let (t5_emb, clip_emb) = self.encoders.encode(
            input.prompt,
            self.variant.t5_max_tokens(),
            &self.device,
            self.dtype,
        )?;
        let state = sampling::State::new(&t5_emb, &clip_emb, &noise)?;
        let shift = self.variant.schedule_shift(state.img.dim(1)?);
        let timesteps = sampling::get_schedule(input.steps, shift);

        // --- Denoise ---
        let flux_model = self
            .flux_model
            .as_ref()
            .context("flux transformer is not loaded")?;
        let latent_img = sampling::denoise(
            flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            input.guidance_scale,
        )?;
        let unpacked = sampling::unpack(&latent_img, height, width)?;
        debug!("generated latent image");

        // --- Decode and convert to 8-bit RGB ---
        let decoded = self.autoencoder.decode(&unpacked)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }

    fn supports_offload(&self) -> bool {
        true
    }

    fn supports_adapter(&self) -> bool {
        true
    }

    /// Moves the text encoders to the CPU, keeping only the transformer and
    /// autoencoder in device memory.
    fn enable_cpu_offload(&mut self) -> Result<()> {
        if self.device.is_cpu() {
            return Ok(());
        }
        info!("offloading text encoders to cpu");
        self.encoders = TextEncoders::load(&self.files, &Device::Cpu, DType::F32)?;
        Ok(())
    }

    /// Merges the adapter into the transformer weights on the host, then
    /// rebuilds the transformer on the device.
    fn attach_adapter(&mut self, adapter: &AdapterBinding) -> Result<()> {
        let weights = merged_transformer_weights(&self.files.transformer, adapter)?;

        // Free the device copy before uploading the merged one.
        self.flux_model = None;
        let vb = VarBuilder::from_tensors(weights, self.dtype, &self.device);
        let flux_model = model::Flux::new(&self.variant.model_config(), vb)
            .context("failed to rebuild flux model")?;
        self.flux_model = Some(flux_model);
        Ok(())
    }
}

/// Downloads FLUX weights from the Hugging Face hub and builds pipelines.
pub struct FluxLoader {
    variant: FluxVariant,
    api: Api,
}

impl FluxLoader {
    pub fn new(variant: FluxVariant) -> Result<Self> {
        Ok(Self {
            variant,
            api: Api::new().context("failed to create hf hub API")?,
        })
    }

    pub fn variant(&self) -> FluxVariant {
        self.variant
    }

    fn fetch(&self) -> Result<WeightFiles> {
        let t5_repo = self.api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model = t5_repo
            .get("model.safetensors")
            .context("failed to get T5 model file")?;
        let t5_config = t5_repo.get("config.json").context("failed to get T5 config")?;
        let t5_tokenizer = self
            .api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .context("failed to get T5 tokenizer")?;

        let clip_repo = self.api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model = clip_repo
            .get("model.safetensors")
            .context("failed to get CLIP model file")?;
        let clip_tokenizer = clip_repo
            .get("tokenizer.json")
            .context("failed to get CLIP tokenizer")?;

        let bf_repo = self
            .api
            .repo(hf_hub::Repo::model(self.variant.repo().to_string()));
        let autoencoder = bf_repo
            .get("ae.safetensors")
            .context("failed to get autoencoder model file")?;
        let transformer = bf_repo
            .get(self.variant.transformer_file())
            .context("failed to get flux model file")?;

        Ok(WeightFiles {
            t5_model,
            t5_config,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            transformer,
        })
    }
}

impl Loader for FluxLoader {
    type Pipeline = FluxPipeline;

    fn environment(&self) -> EnvironmentSnapshot {
        probe_environment()
    }

    fn load(&self, resolved: &ResolvedDevice) -> Result<Self::Pipeline> {
        let device = open_device(resolved.device).context("failed to set up device")?;
        let dtype = dtype_of(resolved);
        info!(
            "loading {} on {} ({:?})",
            self.variant.repo(),
            resolved.device,
            dtype
        );

        let files = self.fetch()?;
        let encoders = TextEncoders::load(&files, &device, dtype)?;

        // --- Autoencoder ---
        let autoencoder_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.autoencoder], dtype, &device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder =
            autoencoder::AutoEncoder::new(&self.variant.autoencoder_config(), autoencoder_vb)
                .context("failed to load autoencoder")?;

        // --- Flux transformer ---
        let flux_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.transformer], dtype, &device)
                .context("failed to build flux var builder")?
        };
        let flux_model = model::Flux::new(&self.variant.model_config(), flux_vb)
            .context("failed to load flux model")?;

        Ok(FluxPipeline {
            variant: self.variant,
            device,
            dtype,
            files,
            encoders,
            autoencoder,
            flux_model: Some(flux_model),
        })
    }
}
