//! DDPM noise scheduler for diffusion training
//! Forward-process noising and the training target for each prediction type

use anyhow::{Context, Result};
use candle_core::{Device, DType, Tensor};
use rand::Rng;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use super::error::TrainError;

/// `scheduler/scheduler_config.json` as written by diffusers
#[derive(Debug, Clone, Deserialize)]
pub struct NoiseSchedulerConfig {
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,
    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: String,
    #[serde(default = "default_prediction_type")]
    pub prediction_type: String,
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_beta_start() -> f64 {
    0.0001
}

fn default_beta_end() -> f64 {
    0.02
}

fn default_beta_schedule() -> String {
    "linear".to_string()
}

fn default_prediction_type() -> String {
    "epsilon".to_string()
}

impl Default for NoiseSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: default_beta_schedule(),
            prediction_type: default_prediction_type(),
        }
    }
}

impl NoiseSchedulerConfig {
    pub fn from_pretrained(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join("scheduler").join("scheduler_config.json");
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read scheduler config: {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse scheduler config: {}", path.display()))?;
        Ok(config)
    }
}

/// What the backbone is trained to predict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

impl PredictionType {
    pub fn parse(value: &str) -> Result<Self, TrainError> {
        match value {
            "epsilon" => Ok(PredictionType::Epsilon),
            "v_prediction" => Ok(PredictionType::VPrediction),
            other => Err(TrainError::UnknownPredictionType(other.to_string())),
        }
    }
}

pub struct DDPMScheduler {
    config: NoiseSchedulerConfig,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
}

impl DDPMScheduler {
    pub fn new(config: NoiseSchedulerConfig, device: &Device) -> Result<Self> {
        let n = config.num_train_timesteps;
        if n < 2 {
            return Err(TrainError::InvalidConfig(format!("num_train_timesteps must be at least 2, got {}", n)).into());
        }

        let betas = match config.beta_schedule.as_str() {
            "linear" => linear_betas(n, config.beta_start, config.beta_end),
            "scaled_linear" => scaled_linear_betas(n, config.beta_start, config.beta_end),
            "squaredcos_cap_v2" => cosine_betas(n),
            other => {
                return Err(TrainError::InvalidConfig(format!("beta_schedule `{}` is not implemented", other)).into())
            }
        };

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut running = 1.0f64;
        for beta in &betas {
            running *= 1.0 - beta;
            alphas_cumprod.push(running);
        }

        let sqrt_alpha: Vec<f32> = alphas_cumprod.iter().map(|a| a.sqrt() as f32).collect();
        let sqrt_one_minus: Vec<f32> = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt() as f32).collect();

        Ok(Self {
            config,
            sqrt_alphas_cumprod: Tensor::from_vec(sqrt_alpha, n, device)?,
            sqrt_one_minus_alphas_cumprod: Tensor::from_vec(sqrt_one_minus, n, device)?,
        })
    }

    pub fn from_pretrained(model_dir: &Path, device: &Device) -> Result<Self> {
        Self::new(NoiseSchedulerConfig::from_pretrained(model_dir)?, device)
    }

    pub fn config(&self) -> &NoiseSchedulerConfig {
        &self.config
    }

    /// Get the number of training timesteps
    pub fn num_train_timesteps(&self) -> usize {
        self.config.num_train_timesteps
    }

    /// Sample one timestep per example, uniform over the training range
    pub fn sample_timesteps<R: Rng>(&self, batch_size: usize, rng: &mut R, device: &Device) -> Result<Tensor> {
        let timesteps: Vec<u32> = (0..batch_size)
            .map(|_| rng.gen_range(0..self.config.num_train_timesteps) as u32)
            .collect();
        Ok(Tensor::from_vec(timesteps, batch_size, device)?)
    }

    /// Per-example coefficients reshaped to broadcast over `[B, C, H, W]`
    fn coefficients(&self, timesteps: &Tensor, like: &Tensor) -> Result<(Tensor, Tensor)> {
        let batch_size = timesteps.dims1()?;
        let mut shape = vec![batch_size];
        shape.extend(std::iter::repeat(1).take(like.rank().saturating_sub(1)));

        let timesteps = timesteps.to_dtype(DType::U32)?;
        let sqrt_alpha_prod = self
            .sqrt_alphas_cumprod
            .index_select(&timesteps, 0)?
            .reshape(shape.as_slice())?
            .to_dtype(like.dtype())?;
        let sqrt_one_minus_alpha_prod = self
            .sqrt_one_minus_alphas_cumprod
            .index_select(&timesteps, 0)?
            .reshape(shape.as_slice())?
            .to_dtype(like.dtype())?;
        Ok((sqrt_alpha_prod, sqrt_one_minus_alpha_prod))
    }

    /// noisy = sqrt(alpha_bar_t) * x0 + sqrt(1 - alpha_bar_t) * noise
    pub fn add_noise(&self, original_samples: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let (sqrt_alpha_prod, sqrt_one_minus_alpha_prod) = self.coefficients(timesteps, original_samples)?;
        let scaled_original = sqrt_alpha_prod.broadcast_mul(original_samples)?;
        let scaled_noise = sqrt_one_minus_alpha_prod.broadcast_mul(noise)?;
        Ok((scaled_original + scaled_noise)?)
    }

    /// v = sqrt(alpha_bar_t) * noise - sqrt(1 - alpha_bar_t) * x0
    pub fn get_velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let (sqrt_alpha_prod, sqrt_one_minus_alpha_prod) = self.coefficients(timesteps, sample)?;
        let velocity = (sqrt_alpha_prod.broadcast_mul(noise)? - sqrt_one_minus_alpha_prod.broadcast_mul(sample)?)?;
        Ok(velocity)
    }

    /// Regression target for the configured prediction type
    pub fn training_target(&self, latents: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        match PredictionType::parse(&self.config.prediction_type)? {
            PredictionType::Epsilon => Ok(noise.clone()),
            PredictionType::VPrediction => self.get_velocity(latents, noise, timesteps),
        }
    }
}

fn linear_betas(n: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
    (0..n)
        .map(|i| beta_start + (beta_end - beta_start) * i as f64 / (n as f64 - 1.0))
        .collect()
}

fn scaled_linear_betas(n: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
    let start = beta_start.sqrt();
    let end = beta_end.sqrt();
    (0..n)
        .map(|i| {
            let t = start + (end - start) * i as f64 / (n as f64 - 1.0);
            t * t
        })
        .collect()
}

fn cosine_betas(n: usize) -> Vec<f64> {
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::PI / 2.0).cos().powi(2);
    (0..n)
        .map(|i| {
            let t1 = i as f64 / n as f64;
            let t2 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
        })
        .collect()
}
