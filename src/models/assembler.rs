use anyhow::Result;
use candle_core::{DType, Device};
use log::{info, warn};

use super::autoencoder::FrozenAutoencoder;
use super::text_encoder::{resolve_text_encoder, ClipTextConditioner};
use super::unet::{BackbonePolicy, UNetBackbone};
use super::{DenoisingBackbone, LatentEncoder, TextConditioner};
use crate::trainers::config::TrainingConfig;
use crate::trainers::ddpm_scheduler::DDPMScheduler;
use crate::trainers::error::TrainError;
use crate::trainers::optimizer::NamedVar;

/// Everything the loop needs from the pretrained pipeline
pub struct AssembledModels {
    pub text_encoder: Box<dyn TextConditioner>,
    pub vae: Box<dyn LatentEncoder>,
    pub unet: Box<dyn DenoisingBackbone>,
    pub noise_scheduler: DDPMScheduler,
    pub weight_dtype: DType,
}

impl AssembledModels {
    /// U-Net variables followed by text-encoder variables when it is trained
    pub fn trainable_parameters(&self) -> Vec<NamedVar> {
        let mut params = self.unet.trainable_parameters();
        params.extend(self.text_encoder.trainable_parameters());
        params
    }
}

pub struct ModelAssembler<'a> {
    config: &'a TrainingConfig,
    device: Device,
}

impl<'a> ModelAssembler<'a> {
    pub fn new(config: &'a TrainingConfig, device: Device) -> Self {
        Self { config, device }
    }

    pub fn assemble(&self) -> Result<AssembledModels> {
        let config = self.config;
        let model_dir = config.pretrained_model_name_or_path.as_path();
        if let Some(revision) = &config.revision {
            info!("Using local weights for revision {}", revision);
        }

        // Architecture check first so an unsupported encoder fails before any weights load
        let (architecture, encoder_config) = resolve_text_encoder(model_dir)?;
        let use_flash_attn = memory_efficient_attention(config.enable_memory_efficient_attention)?;
        let weight_dtype = config.mixed_precision.weight_dtype();

        let noise_scheduler = DDPMScheduler::from_pretrained(model_dir, &self.device)?;

        let text_encoder = if config.train_text_encoder {
            if config.gradient_checkpointing {
                warn!("Gradient checkpointing requested; candle keeps full activations for the text encoder");
            }
            ClipTextConditioner::load_trainable(model_dir, architecture, &encoder_config, &self.device)?
        } else {
            ClipTextConditioner::load_frozen(model_dir, architecture, &encoder_config, weight_dtype, &self.device)?
        };

        let vae = FrozenAutoencoder::load(model_dir, weight_dtype, &self.device)?;

        let unet = UNetBackbone::load(
            model_dir,
            BackbonePolicy {
                gradient_checkpointing: config.gradient_checkpointing,
                memory_efficient_attention: use_flash_attn,
            },
            &self.device,
        )?;

        Ok(AssembledModels {
            text_encoder: Box::new(text_encoder),
            vae: Box::new(vae),
            unet: Box::new(unet),
            noise_scheduler,
            weight_dtype,
        })
    }
}

/// Whether the U-Net may use flash attention for this build
pub fn memory_efficient_attention(requested: bool) -> Result<bool, TrainError> {
    if !requested {
        return Ok(false);
    }
    if cfg!(feature = "flash-attn") {
        Ok(true)
    } else {
        Err(TrainError::MissingOptionalDependency {
            feature: "memory-efficient attention",
            hint: "rebuild with `cargo build --features flash-attn` to use --enable_xformers_memory_efficient_attention",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attention_not_requested() {
        assert!(!memory_efficient_attention(false).unwrap());
    }

    #[cfg(not(feature = "flash-attn"))]
    #[test]
    fn test_attention_without_feature() {
        assert!(matches!(
            memory_efficient_attention(true),
            Err(TrainError::MissingOptionalDependency { .. })
        ));
    }
}
