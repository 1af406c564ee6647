use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::unet_2d::{self, BlockConfig, UNet2DConditionModelConfig};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::weights::{component_weights, read_component_config, TrainableWeights};
use super::DenoisingBackbone;
use crate::trainers::optimizer::NamedVar;

pub const UNET_PREFIX: &str = "unet";

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PerBlock {
    Shared(usize),
    Blocks(Vec<usize>),
}

impl PerBlock {
    fn get(&self, index: usize) -> usize {
        match self {
            Self::Shared(value) => *value,
            Self::Blocks(values) => values.get(index).or(values.last()).copied().unwrap_or(8),
        }
    }
}

/// `unet/config.json` as written by diffusers
#[derive(Debug, Clone, Deserialize)]
pub struct DiffusersUNetConfig {
    #[serde(default = "default_channels")]
    pub in_channels: usize,
    #[serde(default = "default_channels")]
    pub out_channels: usize,
    #[serde(default = "default_block_out_channels")]
    pub block_out_channels: Vec<usize>,
    #[serde(default = "default_down_block_types")]
    pub down_block_types: Vec<String>,
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,
    #[serde(default = "default_attention_head_dim")]
    pub attention_head_dim: PerBlock,
    #[serde(default)]
    pub transformer_layers_per_block: Option<PerBlock>,
    #[serde(default = "default_cross_attention_dim")]
    pub cross_attention_dim: usize,
    #[serde(default)]
    pub use_linear_projection: bool,
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default)]
    pub center_input_sample: bool,
    #[serde(default = "default_true")]
    pub flip_sin_to_cos: bool,
    #[serde(default)]
    pub freq_shift: f64,
    #[serde(default = "default_one")]
    pub downsample_padding: usize,
    #[serde(default = "default_mid_block_scale_factor")]
    pub mid_block_scale_factor: f64,
}

fn default_channels() -> usize {
    4
}
fn default_block_out_channels() -> Vec<usize> {
    vec![320, 640, 1280, 1280]
}
fn default_down_block_types() -> Vec<String> {
    vec![
        "CrossAttnDownBlock2D".into(),
        "CrossAttnDownBlock2D".into(),
        "CrossAttnDownBlock2D".into(),
        "DownBlock2D".into(),
    ]
}
fn default_layers_per_block() -> usize {
    2
}
fn default_attention_head_dim() -> PerBlock {
    PerBlock::Shared(8)
}
fn default_cross_attention_dim() -> usize {
    768
}
fn default_norm_num_groups() -> usize {
    32
}
fn default_norm_eps() -> f64 {
    1e-5
}
fn default_true() -> bool {
    true
}
fn default_one() -> usize {
    1
}
fn default_mid_block_scale_factor() -> f64 {
    1.0
}

impl DiffusersUNetConfig {
    pub fn to_candle(&self) -> UNet2DConditionModelConfig {
        let blocks = self
            .block_out_channels
            .iter()
            .enumerate()
            .map(|(i, &out_channels)| {
                let cross_attn = self
                    .down_block_types
                    .get(i)
                    .map_or(false, |kind| kind.starts_with("CrossAttn"));
                let transformer_layers = self.transformer_layers_per_block.as_ref().map_or(1, |t| t.get(i));
                BlockConfig {
                    out_channels,
                    use_cross_attn: cross_attn.then_some(transformer_layers),
                    attention_head_dim: self.attention_head_dim.get(i),
                }
            })
            .collect();

        UNet2DConditionModelConfig {
            center_input_sample: self.center_input_sample,
            flip_sin_to_cos: self.flip_sin_to_cos,
            freq_shift: self.freq_shift,
            blocks,
            layers_per_block: self.layers_per_block,
            downsample_padding: self.downsample_padding,
            mid_block_scale_factor: self.mid_block_scale_factor,
            norm_num_groups: self.norm_num_groups,
            norm_eps: self.norm_eps,
            cross_attention_dim: self.cross_attention_dim,
            sliced_attention_size: None,
            use_linear_projection: self.use_linear_projection,
        }
    }
}

/// How the U-Net was built, reported in the run banner and metrics log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackbonePolicy {
    pub gradient_checkpointing: bool,
    pub memory_efficient_attention: bool,
}

/// Trainable U-Net; every weight is an f32 variable
pub struct UNetBackbone {
    model: unet_2d::UNet2DConditionModel,
    weights: TrainableWeights,
    policy: BackbonePolicy,
}

impl UNetBackbone {
    pub fn load(model_dir: &Path, policy: BackbonePolicy, device: &Device) -> Result<Self> {
        let config: DiffusersUNetConfig = read_component_config(model_dir, "unet")?;
        let path = component_weights(model_dir, "unet")?;

        let weights = TrainableWeights::new(UNET_PREFIX);
        let model = unet_2d::UNet2DConditionModel::new(
            weights.var_builder(device),
            config.in_channels,
            config.out_channels,
            policy.memory_efficient_attention,
            config.to_candle(),
        )?;
        weights.init_from(&path, device)?;

        if policy.gradient_checkpointing {
            warn!("Gradient checkpointing requested; candle keeps full activations for the U-Net");
        }
        info!(
            "Loaded trainable U-Net: {} tensors, cross_attention_dim {}",
            weights.named_vars().len(),
            config.cross_attention_dim
        );
        Ok(Self { model, weights, policy })
    }
}

impl DenoisingBackbone for UNetBackbone {
    fn predict(&self, noisy_latents: &Tensor, timesteps: &Tensor, encoder_hidden_states: &Tensor) -> Result<Tensor> {
        // candle's U-Net takes a single scalar timestep, so examples go through one at a time
        let timesteps = timesteps.to_dtype(DType::F64)?.to_vec1::<f64>()?;
        let mut outputs = Vec::with_capacity(timesteps.len());
        for (i, &t) in timesteps.iter().enumerate() {
            let sample = noisy_latents.narrow(0, i, 1)?;
            let context = encoder_hidden_states.narrow(0, i, 1)?;
            outputs.push(self.model.forward(&sample, t, &context)?);
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }

    fn trainable_parameters(&self) -> Vec<NamedVar> {
        self.weights.named_vars()
    }

    fn policy(&self) -> BackbonePolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sd15_config() -> Result<()> {
        let json = r#"{
            "_class_name": "UNet2DConditionModel",
            "attention_head_dim": 8,
            "block_out_channels": [320, 640, 1280, 1280],
            "cross_attention_dim": 768,
            "down_block_types": ["CrossAttnDownBlock2D", "CrossAttnDownBlock2D", "CrossAttnDownBlock2D", "DownBlock2D"],
            "in_channels": 4,
            "layers_per_block": 2,
            "out_channels": 4
        }"#;
        let config: DiffusersUNetConfig = serde_json::from_str(json)?;
        let candle = config.to_candle();
        assert_eq!(candle.blocks.len(), 4);
        assert_eq!(candle.blocks[0].use_cross_attn, Some(1));
        assert_eq!(candle.blocks[3].use_cross_attn, None);
        assert_eq!(candle.blocks[2].attention_head_dim, 8);
        assert!(!candle.use_linear_projection);
        Ok(())
    }

    #[test]
    fn test_sd21_per_block_heads() -> Result<()> {
        let json = r#"{
            "attention_head_dim": [5, 10, 20, 20],
            "cross_attention_dim": 1024,
            "use_linear_projection": true
        }"#;
        let config: DiffusersUNetConfig = serde_json::from_str(json)?;
        let candle = config.to_candle();
        let heads: Vec<_> = candle.blocks.iter().map(|b| b.attention_head_dim).collect();
        assert_eq!(heads, vec![5, 10, 20, 20]);
        assert_eq!(candle.cross_attention_dim, 1024);
        assert!(candle.use_linear_projection);
        Ok(())
    }
}
