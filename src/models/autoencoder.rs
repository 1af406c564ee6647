use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use log::info;
use serde::Deserialize;
use std::path::Path;

use super::weights::{component_weights, frozen_var_builder, read_component_config};
use super::LatentEncoder;

/// Latent scale of Stable Diffusion 1.x / 2.x autoencoders
pub const VAE_SCALING_FACTOR: f64 = 0.18215;

/// Keys of `vae/config.json` that shape the network
#[derive(Debug, Clone, Deserialize)]
pub struct DiffusersVaeConfig {
    #[serde(default = "default_block_out_channels")]
    pub block_out_channels: Vec<usize>,
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,
    #[serde(default = "default_channels")]
    pub in_channels: usize,
    #[serde(default = "default_channels")]
    pub out_channels: usize,
}

fn default_block_out_channels() -> Vec<usize> {
    vec![128, 256, 512, 512]
}

fn default_layers_per_block() -> usize {
    2
}

fn default_latent_channels() -> usize {
    4
}

fn default_norm_num_groups() -> usize {
    32
}

fn default_channels() -> usize {
    3
}

impl DiffusersVaeConfig {
    pub fn to_candle(&self) -> AutoEncoderKLConfig {
        AutoEncoderKLConfig {
            block_out_channels: self.block_out_channels.clone(),
            layers_per_block: self.layers_per_block,
            latent_channels: self.latent_channels,
            norm_num_groups: self.norm_num_groups,
            use_quant_conv: true,
            use_post_quant_conv: true,
        }
    }
}

/// Always-frozen VAE; only the encoder half is used during training
pub struct FrozenAutoencoder {
    vae: AutoEncoderKL,
    dtype: DType,
}

impl FrozenAutoencoder {
    pub fn load(model_dir: &Path, dtype: DType, device: &Device) -> Result<Self> {
        let config: DiffusersVaeConfig = read_component_config(model_dir, "vae")?;
        let path = component_weights(model_dir, "vae")?;
        let vb = frozen_var_builder(&path, dtype, device)?;
        let vae = AutoEncoderKL::new(vb, config.in_channels, config.out_channels, config.to_candle())?;
        info!("Loaded frozen VAE ({:?})", dtype);
        Ok(Self { vae, dtype })
    }
}

impl LatentEncoder for FrozenAutoencoder {
    fn encode_latents(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let pixels = pixel_values.to_dtype(self.dtype)?;
        let posterior = self.vae.encode(&pixels)?;
        let latents = (posterior.sample()? * VAE_SCALING_FACTOR)?;
        Ok(latents.to_dtype(DType::F32)?.detach())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_match_sd() -> Result<()> {
        let config: DiffusersVaeConfig = serde_json::from_str(r#"{"_class_name": "AutoencoderKL", "sample_size": 512}"#)?;
        let candle = config.to_candle();
        assert_eq!(candle.block_out_channels, vec![128, 256, 512, 512]);
        assert_eq!(candle.latent_channels, 4);
        assert_eq!(config.in_channels, 3);
        Ok(())
    }
}
