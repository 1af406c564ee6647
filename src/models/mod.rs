//! Pipeline components used by DreamBooth training.
//!
//! The loop driver only sees the three traits below; the candle-backed
//! implementations live in the submodules and are put together by
//! [`assembler::ModelAssembler`].

use anyhow::Result;
use candle_core::Tensor;

use crate::trainers::optimizer::NamedVar;

pub mod assembler;
pub mod autoencoder;
pub mod text_encoder;
pub mod unet;
pub mod weights;

pub use assembler::{AssembledModels, ModelAssembler};
pub use autoencoder::{FrozenAutoencoder, VAE_SCALING_FACTOR};
pub use text_encoder::{ClipTextConditioner, TextEncoderArchitecture};
pub use unet::{BackbonePolicy, DiffusersUNetConfig, UNetBackbone};

/// Turns token ids into the encoder hidden states the U-Net attends to
pub trait TextConditioner {
    /// `input_ids`: u32 `(batch, seq_len)`; returns f32 `(batch, seq_len, hidden)`
    fn encode(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Empty when the encoder is frozen
    fn trainable_parameters(&self) -> Vec<NamedVar>;

    fn is_trainable(&self) -> bool {
        !self.trainable_parameters().is_empty()
    }
}

/// Maps pixel values in `[-1, 1]` to scaled latents
pub trait LatentEncoder {
    fn encode_latents(&self, pixel_values: &Tensor) -> Result<Tensor>;
}

/// Predicts noise (or velocity) for noisy latents at per-example timesteps
pub trait DenoisingBackbone {
    fn predict(&self, noisy_latents: &Tensor, timesteps: &Tensor, encoder_hidden_states: &Tensor) -> Result<Tensor>;

    fn trainable_parameters(&self) -> Vec<NamedVar>;

    fn policy(&self) -> BackbonePolicy {
        BackbonePolicy::default()
    }
}
