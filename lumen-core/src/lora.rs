//! Fused LoRA: adapter deltas are merged into the base weights before the
//! model is built, so sampling runs at full speed.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, warn};

/// Prefixes trainers put in front of the base model's own weight names.
const KNOWN_PREFIXES: [&str; 4] = [
    "base_model.model.",
    "transformer.",
    "diffusion_model.",
    "lora_unet_",
];

/// Tensor names making up one low-rank layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerNames {
    pub down: Option<String>,
    pub up: Option<String>,
    pub alpha: Option<String>,
}

/// Groups adapter tensor names by layer. Both the peft (`lora_A`/`lora_B`)
/// and kohya (`lora_down`/`lora_up`) conventions are recognized.
pub fn group_layers<'a>(names: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, LayerNames> {
    let mut layers: BTreeMap<String, LayerNames> = BTreeMap::new();
    for name in names {
        let (layer, slot) = if let Some(layer) = name
            .strip_suffix(".lora_A.weight")
            .or_else(|| name.strip_suffix(".lora_down.weight"))
        {
            (layer, 0)
        } else if let Some(layer) = name
            .strip_suffix(".lora_B.weight")
            .or_else(|| name.strip_suffix(".lora_up.weight"))
        {
            (layer, 1)
        } else if let Some(layer) = name.strip_suffix(".alpha") {
            (layer, 2)
        } else {
            continue;
        };
        let entry = layers.entry(layer.to_string()).or_default();
        let slot = match slot {
            0 => &mut entry.down,
            1 => &mut entry.up,
            _ => &mut entry.alpha,
        };
        *slot = Some(name.to_string());
    }
    layers
}

/// Rows of a base weight a layer updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rows {
    All,
    /// Block `index` of equally sized row blocks, as q/k/v inside a fused qkv.
    Chunk(usize),
    /// The trailing rows, as the mlp input inside a fused linear.
    Tail,
}

/// Where a layer's delta lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target<'a> {
    pub key: &'a str,
    pub rows: Rows,
}

/// Maps adapter layer names onto base weight names.
pub struct BaseIndex<'a> {
    dotted: HashMap<&'a str, &'a str>,
    flattened: HashMap<String, &'a str>,
}

impl<'a> BaseIndex<'a> {
    pub fn new(keys: impl IntoIterator<Item = &'a String>) -> Self {
        let mut dotted = HashMap::new();
        let mut flattened = HashMap::new();
        for key in keys {
            if let Some(stem) = key.strip_suffix(".weight") {
                dotted.insert(stem, key.as_str());
                flattened.insert(stem.replace('.', "_"), key.as_str());
            }
        }
        Self { dotted, flattened }
    }

    /// The base weight a layer applies to. Accepts dotted names, the
    /// underscore-flattened names kohya writes, and diffusers names whose
    /// split projections map onto rows of a fused weight.
    pub fn lookup(&self, layer: &str) -> Option<Target<'a>> {
        let mut stem = layer;
        for prefix in KNOWN_PREFIXES {
            if let Some(rest) = stem.strip_prefix(prefix) {
                stem = rest;
            }
        }
        let whole = self
            .dotted
            .get(stem)
            .copied()
            .or_else(|| self.flattened.get(&stem.replace('.', "_")).copied());
        if let Some(key) = whole {
            return Some(Target {
                key,
                rows: Rows::All,
            });
        }

        let (fused, rows) = diffusers_layer(stem)?;
        self.dotted
            .get(fused.as_str())
            .map(|&key| Target { key, rows })
    }
}

/// Translates a diffusers FLUX layer onto the fused layout of the base model.
fn diffusers_layer(stem: &str) -> Option<(String, Rows)> {
    if let Some(rest) = stem.strip_prefix("transformer_blocks.") {
        let (block, inner) = rest.split_once('.')?;
        let (target, rows) = match inner {
            "attn.to_q" => ("img_attn.qkv", Rows::Chunk(0)),
            "attn.to_k" => ("img_attn.qkv", Rows::Chunk(1)),
            "attn.to_v" => ("img_attn.qkv", Rows::Chunk(2)),
            "attn.add_q_proj" => ("txt_attn.qkv", Rows::Chunk(0)),
            "attn.add_k_proj" => ("txt_attn.qkv", Rows::Chunk(1)),
            "attn.add_v_proj" => ("txt_attn.qkv", Rows::Chunk(2)),
            "attn.to_out.0" => ("img_attn.proj", Rows::All),
            "attn.to_add_out" => ("txt_attn.proj", Rows::All),
            "ff.net.0.proj" => ("img_mlp.0", Rows::All),
            "ff.net.2" => ("img_mlp.2", Rows::All),
            "ff_context.net.0.proj" => ("txt_mlp.0", Rows::All),
            "ff_context.net.2" => ("txt_mlp.2", Rows::All),
            "norm1.linear" => ("img_mod.lin", Rows::All),
            "norm1_context.linear" => ("txt_mod.lin", Rows::All),
            _ => return None,
        };
        return Some((format!("double_blocks.{block}.{target}"), rows));
    }

    let rest = stem.strip_prefix("single_transformer_blocks.")?;
    let (block, inner) = rest.split_once('.')?;
    let (target, rows) = match inner {
        "attn.to_q" => ("linear1", Rows::Chunk(0)),
        "attn.to_k" => ("linear1", Rows::Chunk(1)),
        "attn.to_v" => ("linear1", Rows::Chunk(2)),
        "proj_mlp" => ("linear1", Rows::Tail),
        "proj_out" => ("linear2", Rows::All),
        "norm.linear" => ("modulation.lin", Rows::All),
        _ => return None,
    };
    Some((format!("single_blocks.{block}.{target}"), rows))
}

/// Zero-pads `delta` to the base shape so it lands on `rows`. `None` when
/// it does not fit.
fn fit_rows(delta: Tensor, base: &[usize], rows: Rows) -> Result<Option<Tensor>> {
    let (&[out, cols], &[n, delta_cols]) = (base, delta.dims()) else {
        return Ok(None);
    };
    if cols != delta_cols {
        return Ok(None);
    }
    let offset = match rows {
        Rows::All if n != out => return Ok(None),
        Rows::All => 0,
        Rows::Chunk(index) => index * n,
        Rows::Tail => out.saturating_sub(n),
    };
    if offset + n > out {
        return Ok(None);
    }
    if n == out {
        return Ok(Some(delta));
    }
    Ok(Some(delta.pad_with_zeros(0, offset, out - offset - n)?))
}

#[derive(Debug, Clone)]
pub struct LoraLayer {
    pub name: String,
    /// (rank, in_features)
    pub down: Tensor,
    /// (out_features, rank)
    pub up: Tensor,
    pub alpha: Option<f64>,
}

impl LoraLayer {
    /// `scale * (alpha / rank) * (up @ down)` in f32.
    pub fn delta(&self, scale: f64) -> Result<Tensor> {
        let rank = self.down.dim(0)?;
        let alpha = self.alpha.unwrap_or(rank as f64);
        let up = self.up.to_dtype(DType::F32)?;
        let down = self.down.to_dtype(DType::F32)?;
        Ok((up.matmul(&down)? * (scale * alpha / rank as f64))?)
    }
}

#[derive(Debug, Clone)]
pub struct LoraAdapter {
    pub layers: Vec<LoraLayer>,
}

impl LoraAdapter {
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read LoRA weights {}", path.display()))?;
        let header = safetensors::SafeTensors::deserialize(&bytes)
            .with_context(|| format!("{} is not a safetensors file", path.display()))?;
        let grouped = group_layers(header.names().into_iter().map(String::as_str));
        let mut tensors = candle_core::safetensors::load_buffer(&bytes, device)?;

        let mut layers = Vec::with_capacity(grouped.len());
        for (name, names) in grouped {
            let (Some(down), Some(up)) = (names.down, names.up) else {
                debug!("skipping incomplete LoRA layer {name}");
                continue;
            };
            let (Some(down), Some(up)) = (tensors.remove(&down), tensors.remove(&up)) else {
                continue;
            };
            let alpha = match names.alpha.and_then(|a| tensors.remove(&a)) {
                Some(alpha) => alpha
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?
                    .first()
                    .map(|&a| a as f64),
                None => None,
            };
            layers.push(LoraLayer {
                name,
                down,
                up,
                alpha,
            });
        }

        if layers.is_empty() {
            bail!("no LoRA layers found in {}", path.display());
        }
        Ok(Self { layers })
    }

    /// Adds every layer's delta to its base weight, keeping the base dtype.
    /// Returns how many layers were merged.
    pub fn merge_into(&self, weights: &mut HashMap<String, Tensor>, scale: f64) -> Result<usize> {
        let targets: Vec<(usize, String, Rows)> = {
            let index = BaseIndex::new(weights.keys());
            self.layers
                .iter()
                .enumerate()
                .filter_map(|(i, layer)| {
                    let target = index.lookup(&layer.name)?;
                    Some((i, target.key.to_string(), target.rows))
                })
                .collect()
        };

        let mut merged = 0;
        for (i, key, rows) in targets {
            let layer = &self.layers[i];
            let base = &weights[&key];
            let delta = layer.delta(scale)?;
            let delta_dims = delta.dims().to_vec();
            let Some(delta) = fit_rows(delta, base.dims(), rows)? else {
                warn!(
                    "LoRA layer {} has shape {delta_dims:?}, base {key} is {:?} ({rows:?}); skipped",
                    layer.name,
                    base.dims()
                );
                continue;
            };
            let updated = (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?;
            weights.insert(key, updated);
            merged += 1;
        }

        let unmatched = self.layers.len() - merged;
        if unmatched > 0 {
            warn!("{unmatched} LoRA layers did not match any base weight");
        }
        if merged == 0 {
            bail!("none of the {} LoRA layers match the model", self.layers.len());
        }
        Ok(merged)
    }
}
