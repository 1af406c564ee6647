//! Training arguments and their validation
//!
//! `TrainArgs` is what the command line (or a YAML file) provides.
//! `TrainArgs::resolve` turns it into the immutable `TrainingConfig` the rest of
//! the trainer consumes, failing fast before anything expensive is loaded.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use candle_core::DType;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::distributed::WorldInfo;
use super::error::TrainError;
use super::lr_scheduler::LrSchedulerKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MixedPrecision {
    #[default]
    No,
    Fp16,
    Bf16,
}

impl MixedPrecision {
    /// Dtype used for the frozen models
    pub fn weight_dtype(&self) -> DType {
        match self {
            MixedPrecision::No => DType::F32,
            MixedPrecision::Fp16 => DType::F16,
            MixedPrecision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about = "DreamBooth fine-tuning for latent diffusion models", long_about = None)]
#[serde(default)]
pub struct TrainArgs {
    /// YAML file holding these arguments; when given it replaces the command line
    #[arg(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Path to the pretrained model directory (diffusers layout)
    #[arg(long = "pretrained_model_name_or_path")]
    pub pretrained_model_name_or_path: Option<String>,

    /// Revision of the pretrained model, recorded in the exported pipeline
    #[arg(long = "revision")]
    pub revision: Option<String>,

    /// Tokenizer file if not the model's own `tokenizer/tokenizer.json`
    #[arg(long = "tokenizer_name")]
    pub tokenizer_name: Option<String>,

    /// Folder containing the instance images
    #[arg(long = "instance_data_dir")]
    pub instance_data_dir: Option<PathBuf>,

    /// Folder containing the class images
    #[arg(long = "class_data_dir")]
    pub class_data_dir: Option<PathBuf>,

    /// Prompt with the identifier specifying the instance
    #[arg(long = "instance_prompt")]
    pub instance_prompt: Option<String>,

    /// Prompt describing images of the same class as the instance
    #[arg(long = "class_prompt")]
    pub class_prompt: Option<String>,

    /// Add the prior preservation loss
    #[arg(long = "with_prior_preservation")]
    pub with_prior_preservation: bool,

    #[arg(long = "prior_loss_weight", default_value_t = 1.0)]
    pub prior_loss_weight: f32,

    /// Minimal number of class images for prior preservation
    #[arg(long = "num_class_images", default_value_t = 100)]
    pub num_class_images: usize,

    #[arg(long = "output_dir", default_value = "text-inversion-model")]
    pub output_dir: PathBuf,

    #[arg(long = "seed")]
    pub seed: Option<u64>,

    /// Resolution input images are resized to
    #[arg(long = "resolution", default_value_t = 512)]
    pub resolution: usize,

    /// Center crop images instead of cropping at a random position
    #[arg(long = "center_crop")]
    pub center_crop: bool,

    #[arg(long = "train_text_encoder")]
    pub train_text_encoder: bool,

    /// Batch size per device
    #[arg(long = "train_batch_size", default_value_t = 4)]
    pub train_batch_size: usize,

    #[arg(long = "sample_batch_size", default_value_t = 4)]
    pub sample_batch_size: usize,

    #[arg(long = "num_train_epochs", default_value_t = 1)]
    pub num_train_epochs: usize,

    /// Total optimizer updates; overrides num_train_epochs when given
    #[arg(long = "max_train_steps")]
    pub max_train_steps: Option<usize>,

    /// Save resumable state every N optimizer updates
    #[arg(long = "checkpointing_steps", default_value_t = 500)]
    pub checkpointing_steps: usize,

    /// Checkpoint path, or `latest`
    #[arg(long = "resume_from_checkpoint")]
    pub resume_from_checkpoint: Option<String>,

    #[arg(long = "gradient_accumulation_steps", default_value_t = 1)]
    pub gradient_accumulation_steps: usize,

    #[arg(long = "gradient_checkpointing")]
    pub gradient_checkpointing: bool,

    #[arg(long = "learning_rate", default_value_t = 5e-6)]
    pub learning_rate: f64,

    /// Scale the learning rate by processes, accumulation steps and batch size
    #[arg(long = "scale_lr")]
    pub scale_lr: bool,

    #[arg(long = "lr_scheduler", value_enum, default_value_t = LrSchedulerKind::Constant)]
    pub lr_scheduler: LrSchedulerKind,

    #[arg(long = "lr_warmup_steps", default_value_t = 500)]
    pub lr_warmup_steps: usize,

    /// Hard restarts of the cosine_with_restarts schedule
    #[arg(long = "lr_num_cycles", default_value_t = 1)]
    pub lr_num_cycles: usize,

    /// Power factor of the polynomial schedule
    #[arg(long = "lr_power", default_value_t = 1.0)]
    pub lr_power: f64,

    #[arg(long = "use_8bit_adam")]
    pub use_8bit_adam: bool,

    #[arg(long = "adam_beta1", default_value_t = 0.9)]
    pub adam_beta1: f64,

    #[arg(long = "adam_beta2", default_value_t = 0.999)]
    pub adam_beta2: f64,

    #[arg(long = "adam_weight_decay", default_value_t = 1e-2)]
    pub adam_weight_decay: f64,

    #[arg(long = "adam_epsilon", default_value_t = 1e-8)]
    pub adam_epsilon: f64,

    #[arg(long = "max_grad_norm", default_value_t = 1.0)]
    pub max_grad_norm: f64,

    #[arg(long = "push_to_hub")]
    pub push_to_hub: bool,

    #[arg(long = "hub_token")]
    pub hub_token: Option<String>,

    /// Repository kept in sync with the output directory
    #[arg(long = "hub_model_id")]
    pub hub_model_id: Option<String>,

    /// Metrics directory, relative to output_dir
    #[arg(long = "logging_dir", default_value = "logs")]
    pub logging_dir: PathBuf,

    #[arg(long = "mixed_precision", value_enum, default_value_t = MixedPrecision::No)]
    pub mixed_precision: MixedPrecision,

    #[arg(long = "local_rank", default_value_t = -1, allow_negative_numbers = true)]
    pub local_rank: i64,

    #[arg(long = "enable_xformers_memory_efficient_attention")]
    pub enable_xformers_memory_efficient_attention: bool,
}

impl Default for TrainArgs {
    fn default() -> Self {
        Self::parse_from(["trainer"])
    }
}

impl TrainArgs {
    /// Parse the process arguments, switching to the YAML file when `--config` is given
    pub fn load() -> Result<Self> {
        let args = Self::parse();
        match &args.config {
            Some(path) => {
                info!("Loading training arguments from {}", path.display());
                Self::from_yaml(path)
            }
            None => Ok(args),
        }
    }

    pub fn from_yaml(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut args: TrainArgs = serde_yaml::from_str(&config_str)
            .with_context(|| "Failed to parse YAML config")?;
        args.config = Some(path.to_path_buf());
        Ok(args)
    }

    /// `LOCAL_RANK` from the environment wins over the flag when set
    pub fn effective_local_rank(&self) -> i64 {
        let env_local_rank = std::env::var("LOCAL_RANK")
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(-1);
        override_local_rank(self.local_rank, env_local_rank)
    }

    pub fn resolve(self, world: &WorldInfo) -> Result<TrainingConfig> {
        let local_rank = self.effective_local_rank();
        let pretrained_model_name_or_path = required(self.pretrained_model_name_or_path, "pretrained_model_name_or_path")?;
        let instance_prompt = required(self.instance_prompt, "instance_prompt")?;
        let instance_data_dir = self
            .instance_data_dir
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(TrainError::MissingArgument("instance_data_dir"))?;

        for (name, value) in [
            ("train_batch_size", self.train_batch_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("checkpointing_steps", self.checkpointing_steps),
            ("resolution", self.resolution),
            ("num_train_epochs", self.num_train_epochs),
        ] {
            if value == 0 {
                return Err(TrainError::InvalidConfig(format!("{} must be at least 1", name)).into());
            }
        }
        if self.max_train_steps == Some(0) {
            return Err(TrainError::InvalidConfig("max_train_steps must be at least 1".to_string()).into());
        }

        if self.train_text_encoder && self.gradient_accumulation_steps > 1 && world.num_processes > 1 {
            return Err(TrainError::TextEncoderAccumulation.into());
        }

        let prior_preservation = if self.with_prior_preservation {
            let class_data_dir = self.class_data_dir.ok_or_else(|| {
                TrainError::InvalidConfig("You must specify a data directory for class images.".to_string())
            })?;
            let class_prompt = self.class_prompt.ok_or_else(|| {
                TrainError::InvalidConfig("You must specify prompt for class images.".to_string())
            })?;
            Some(PriorPreservation {
                class_data_dir,
                class_prompt,
                prior_loss_weight: self.prior_loss_weight,
                num_class_images: self.num_class_images,
            })
        } else {
            if self.class_data_dir.is_some() {
                warn!("You need not use --class_data_dir without --with_prior_preservation.");
            }
            if self.class_prompt.is_some() {
                warn!("You need not use --class_prompt without --with_prior_preservation.");
            }
            None
        };

        let learning_rate = if self.scale_lr {
            self.learning_rate
                * self.gradient_accumulation_steps as f64
                * self.train_batch_size as f64
                * world.num_processes as f64
        } else {
            self.learning_rate
        };

        let resume_from_checkpoint = self.resume_from_checkpoint.map(|value| {
            if value == "latest" {
                ResumeFrom::Latest
            } else {
                ResumeFrom::Path(PathBuf::from(value))
            }
        });

        Ok(TrainingConfig {
            pretrained_model_name_or_path: PathBuf::from(pretrained_model_name_or_path),
            revision: self.revision,
            tokenizer_name: self.tokenizer_name.map(PathBuf::from),
            instance_data_dir,
            instance_prompt,
            prior_preservation,
            output_dir: self.output_dir,
            seed: self.seed,
            resolution: self.resolution,
            center_crop: self.center_crop,
            train_text_encoder: self.train_text_encoder,
            train_batch_size: self.train_batch_size,
            sample_batch_size: self.sample_batch_size,
            num_train_epochs: self.num_train_epochs,
            max_train_steps: self.max_train_steps,
            checkpointing_steps: self.checkpointing_steps,
            resume_from_checkpoint,
            gradient_accumulation_steps: self.gradient_accumulation_steps,
            gradient_checkpointing: self.gradient_checkpointing,
            learning_rate,
            lr_scheduler: self.lr_scheduler,
            lr_warmup_steps: self.lr_warmup_steps,
            lr_num_cycles: self.lr_num_cycles,
            lr_power: self.lr_power,
            use_8bit_adam: self.use_8bit_adam,
            adam_beta1: self.adam_beta1,
            adam_beta2: self.adam_beta2,
            adam_weight_decay: self.adam_weight_decay,
            adam_epsilon: self.adam_epsilon,
            max_grad_norm: self.max_grad_norm,
            push_to_hub: self.push_to_hub,
            hub_token: self.hub_token,
            hub_model_id: self.hub_model_id,
            logging_dir: self.logging_dir,
            mixed_precision: self.mixed_precision,
            local_rank,
            enable_memory_efficient_attention: self.enable_xformers_memory_efficient_attention,
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, TrainError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(TrainError::MissingArgument(name))
}

fn override_local_rank(flag: i64, env_local_rank: i64) -> i64 {
    if env_local_rank != -1 && env_local_rank != flag {
        env_local_rank
    } else {
        flag
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResumeFrom {
    Latest,
    Path(PathBuf),
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorPreservation {
    pub class_data_dir: PathBuf,
    pub class_prompt: String,
    pub prior_loss_weight: f32,
    pub num_class_images: usize,
}

/// Validated, immutable training settings
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub pretrained_model_name_or_path: PathBuf,
    pub revision: Option<String>,
    pub tokenizer_name: Option<PathBuf>,
    pub instance_data_dir: PathBuf,
    pub instance_prompt: String,
    pub prior_preservation: Option<PriorPreservation>,
    pub output_dir: PathBuf,
    pub seed: Option<u64>,
    pub resolution: usize,
    pub center_crop: bool,
    pub train_text_encoder: bool,
    pub train_batch_size: usize,
    pub sample_batch_size: usize,
    pub num_train_epochs: usize,
    pub max_train_steps: Option<usize>,
    pub checkpointing_steps: usize,
    pub resume_from_checkpoint: Option<ResumeFrom>,
    pub gradient_accumulation_steps: usize,
    pub gradient_checkpointing: bool,
    pub learning_rate: f64,
    pub lr_scheduler: LrSchedulerKind,
    pub lr_warmup_steps: usize,
    pub lr_num_cycles: usize,
    pub lr_power: f64,
    pub use_8bit_adam: bool,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_weight_decay: f64,
    pub adam_epsilon: f64,
    pub max_grad_norm: f64,
    pub push_to_hub: bool,
    pub hub_token: Option<String>,
    pub hub_model_id: Option<String>,
    pub logging_dir: PathBuf,
    pub mixed_precision: MixedPrecision,
    pub local_rank: i64,
    pub enable_memory_efficient_attention: bool,
}

impl TrainingConfig {
    pub fn logging_dir(&self) -> PathBuf {
        self.output_dir.join(&self.logging_dir)
    }

    pub fn with_prior_preservation(&self) -> bool {
        self.prior_preservation.is_some()
    }

    /// Hyperparameters worth recording next to the metrics
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "pretrained_model_name_or_path": self.pretrained_model_name_or_path,
            "instance_prompt": self.instance_prompt,
            "prior_preservation": self.prior_preservation,
            "resolution": self.resolution,
            "train_text_encoder": self.train_text_encoder,
            "train_batch_size": self.train_batch_size,
            "num_train_epochs": self.num_train_epochs,
            "max_train_steps": self.max_train_steps,
            "gradient_accumulation_steps": self.gradient_accumulation_steps,
            "learning_rate": self.learning_rate,
            "lr_scheduler": self.lr_scheduler,
            "lr_warmup_steps": self.lr_warmup_steps,
            "use_8bit_adam": self.use_8bit_adam,
            "mixed_precision": self.mixed_precision,
            "seed": self.seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> TrainArgs {
        TrainArgs::parse_from([
            "trainer",
            "--pretrained_model_name_or_path",
            "models/sd15",
            "--instance_data_dir",
            "data/dog",
            "--instance_prompt",
            "a photo of sks dog",
        ])
    }

    fn world(n: usize) -> WorldInfo {
        WorldInfo {
            num_processes: n,
            process_index: 0,
            local_process_index: 0,
        }
    }

    fn train_error(err: &anyhow::Error) -> &TrainError {
        err.downcast_ref::<TrainError>().expect("expected a TrainError")
    }

    #[test]
    fn test_defaults() {
        let config = base_args().resolve(&world(1)).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("text-inversion-model"));
        assert_eq!(config.resolution, 512);
        assert_eq!(config.train_batch_size, 4);
        assert_eq!(config.num_train_epochs, 1);
        assert_eq!(config.checkpointing_steps, 500);
        assert_eq!(config.gradient_accumulation_steps, 1);
        assert_eq!(config.learning_rate, 5e-6);
        assert_eq!(config.lr_scheduler, LrSchedulerKind::Constant);
        assert_eq!(config.mixed_precision, MixedPrecision::No);
        assert!(config.max_train_steps.is_none());
        assert!(config.resume_from_checkpoint.is_none());
    }

    #[test]
    fn test_missing_required_fields() {
        let mut args = base_args();
        args.instance_prompt = None;
        let err = args.resolve(&world(1)).unwrap_err();
        assert!(matches!(train_error(&err), TrainError::MissingArgument("instance_prompt")));

        let mut args = base_args();
        args.pretrained_model_name_or_path = Some("  ".to_string());
        let err = args.resolve(&world(1)).unwrap_err();
        assert!(matches!(
            train_error(&err),
            TrainError::MissingArgument("pretrained_model_name_or_path")
        ));

        let mut args = base_args();
        args.instance_data_dir = None;
        let err = args.resolve(&world(1)).unwrap_err();
        assert!(matches!(train_error(&err), TrainError::MissingArgument("instance_data_dir")));
    }

    #[test]
    fn test_text_encoder_with_accumulation_rejected_when_distributed() {
        let mut args = base_args();
        args.train_text_encoder = true;
        args.gradient_accumulation_steps = 2;

        let err = args.clone().resolve(&world(2)).unwrap_err();
        assert!(matches!(train_error(&err), TrainError::TextEncoderAccumulation));

        // Same combination is fine on a single process
        assert!(args.resolve(&world(1)).is_ok());
    }

    #[test]
    fn test_prior_preservation_needs_class_inputs() {
        let mut args = base_args();
        args.with_prior_preservation = true;
        let err = args.clone().resolve(&world(1)).unwrap_err();
        assert!(matches!(train_error(&err), TrainError::InvalidConfig(_)));

        args.class_data_dir = Some(PathBuf::from("data/dogs"));
        args.class_prompt = Some("a photo of dog".to_string());
        let config = args.resolve(&world(1)).unwrap();
        let prior = config.prior_preservation.unwrap();
        assert_eq!(prior.class_prompt, "a photo of dog");
        assert_eq!(prior.prior_loss_weight, 1.0);
    }

    #[test]
    fn test_scale_lr() {
        let mut args = base_args();
        args.scale_lr = true;
        args.gradient_accumulation_steps = 2;
        args.train_batch_size = 3;
        let config = args.resolve(&world(2)).unwrap();
        assert!((config.learning_rate - 5e-6 * 12.0).abs() < 1e-12);
    }

    #[test]
    fn test_resume_and_enums_from_flags() {
        let args = TrainArgs::parse_from([
            "trainer",
            "--pretrained_model_name_or_path",
            "m",
            "--instance_data_dir",
            "d",
            "--instance_prompt",
            "p",
            "--resume_from_checkpoint",
            "latest",
            "--lr_scheduler",
            "cosine_with_restarts",
            "--mixed_precision",
            "bf16",
        ]);
        let config = args.resolve(&world(1)).unwrap();
        assert_eq!(config.resume_from_checkpoint, Some(ResumeFrom::Latest));
        assert_eq!(config.lr_scheduler, LrSchedulerKind::CosineWithRestarts);
        assert_eq!(config.mixed_precision.weight_dtype(), DType::BF16);
    }

    #[test]
    fn test_zero_counts_rejected() {
        let mut args = base_args();
        args.gradient_accumulation_steps = 0;
        let err = args.resolve(&world(1)).unwrap_err();
        assert!(matches!(train_error(&err), TrainError::InvalidConfig(_)));
    }

    #[test]
    fn test_local_rank_override() {
        assert_eq!(override_local_rank(-1, 3), 3);
        assert_eq!(override_local_rank(2, -1), 2);
        assert_eq!(override_local_rank(1, 1), 1);
    }

    #[test]
    fn test_resolve_keeps_local_rank_with_all_fields_set() {
        let args = TrainArgs::parse_from([
            "trainer",
            "--pretrained_model_name_or_path",
            "models/sd15",
            "--instance_data_dir",
            "data/dog",
            "--instance_prompt",
            "a photo of sks dog",
            "--with_prior_preservation",
            "--class_data_dir",
            "data/class",
            "--class_prompt",
            "a photo of dog",
            "--resume_from_checkpoint",
            "latest",
            "--local_rank",
            "0",
        ]);
        let expected = args.effective_local_rank();
        let config = args.resolve(&world(1)).unwrap();
        assert_eq!(config.local_rank, expected);
        assert_eq!(config.resume_from_checkpoint, Some(ResumeFrom::Latest));
    }

    #[test]
    fn test_yaml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dream.yaml");
        fs::write(
            &path,
            "pretrained_model_name_or_path: models/sd15\n\
             instance_data_dir: data/dog\n\
             instance_prompt: a photo of sks dog\n\
             max_train_steps: 400\n\
             lr_scheduler: polynomial\n\
             mixed_precision: fp16\n",
        )
        .unwrap();

        let args = TrainArgs::from_yaml(&path).unwrap();
        assert_eq!(args.train_batch_size, 4);
        let config = args.resolve(&world(1)).unwrap();
        assert_eq!(config.max_train_steps, Some(400));
        assert_eq!(config.lr_scheduler, LrSchedulerKind::Polynomial);
        assert_eq!(config.mixed_precision, MixedPrecision::Fp16);
    }
}
