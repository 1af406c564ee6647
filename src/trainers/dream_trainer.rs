//! DreamBooth training loop
//!
//! The trainer owns every piece of mutable run state. Models come in through
//! the traits in [`crate::models`], so the loop itself never touches candle
//! model internals.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::checkpoint::{load_checkpoint, resolve_resume_checkpoint, save_checkpoint, ResumePoint};
use super::config::TrainingConfig;
use super::distributed::DistributedRuntime;
use super::lr_scheduler::ScheduleState;
use super::metrics::{MetricsLogger, StepMetrics};
use super::optimization::{build_lr_schedule, build_optimizer, StepBudget};
use super::optimizer::{clip_grad_norm, GradientAccumulator, NamedVar, ParamOptimizer};
use super::progress::StepProgress;
use crate::export::{hub, HubRepository, PipelineExporter};
use crate::loaders::dreambooth_dataset::{DataLoader, DreamBoothBatch, DreamBoothDataset, DreamBoothDatasetConfig};
use crate::loaders::tokenizer::{ClipTokenizer, PromptTokenizer};
use crate::models::{AssembledModels, ModelAssembler};
use crate::trainers::error::TrainError;

/// Shuffle seed when `--seed` is not given; every process must agree on it
const DEFAULT_SHUFFLE_SEED: u64 = 0x5eed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    NotStarted,
    Running,
    Checkpointing,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingState {
    pub phase: TrainingPhase,
    /// Completed optimizer updates
    pub global_step: usize,
    pub current_epoch: usize,
    pub first_epoch: usize,
    /// Updates already done inside `first_epoch` when resuming
    pub resume_step: usize,
    resumed: bool,
}

impl TrainingState {
    fn new() -> Self {
        Self {
            phase: TrainingPhase::NotStarted,
            global_step: 0,
            current_epoch: 0,
            first_epoch: 0,
            resume_step: 0,
            resumed: false,
        }
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }
}

#[derive(Debug)]
pub struct TrainingSummary {
    pub global_step: usize,
    pub micro_batches: usize,
    pub last_loss: Option<f32>,
    pub checkpoints: Vec<PathBuf>,
    pub pipeline_dir: Option<PathBuf>,
    /// Background hub push, still running when `train` returns
    pub push: Option<JoinHandle<()>>,
}

impl TrainingSummary {
    /// Block until the hub push is done. Push failures were already logged.
    pub fn wait_for_push(&mut self) {
        if let Some(handle) = self.push.take() {
            info!("Waiting for the hub push to finish");
            if handle.join().is_err() {
                error!("Hub push thread panicked");
            }
        }
    }
}

pub struct DreamTrainer {
    config: TrainingConfig,
    models: AssembledModels,
    loader: DataLoader,
    runtime: Box<dyn DistributedRuntime>,
    params: Vec<NamedVar>,
    optimizer: Box<dyn ParamOptimizer>,
    schedule: ScheduleState,
    budget: StepBudget,
    accumulator: GradientAccumulator,
    metrics: MetricsLogger,
    hub: Option<HubRepository>,
    state: TrainingState,
    rng: StdRng,
    device: Device,
}

impl DreamTrainer {
    /// Load the pretrained pipeline from disk and set up the run
    pub fn from_config(config: TrainingConfig, runtime: Box<dyn DistributedRuntime>, device: Device) -> Result<Self> {
        let hub = if runtime.is_main_process() {
            if config.push_to_hub {
                let repo_id = hub::repo_id(config.hub_model_id.as_deref(), &config.output_dir);
                Some(HubRepository::prepare(&config.output_dir, &repo_id, config.hub_token.as_deref())?)
            } else {
                fs::create_dir_all(&config.output_dir).with_context(|| {
                    format!("Failed to create output directory: {}", config.output_dir.display())
                })?;
                None
            }
        } else {
            None
        };

        let models = ModelAssembler::new(&config, device.clone()).assemble()?;
        let tokenizer = ClipTokenizer::load(&config.pretrained_model_name_or_path, config.tokenizer_name.as_deref())?;

        let mut trainer = Self::with_components(config, models, &tokenizer, runtime, device)?;
        trainer.hub = hub;
        Ok(trainer)
    }

    /// Set up the run around already assembled models
    pub fn with_components(
        config: TrainingConfig,
        models: AssembledModels,
        tokenizer: &dyn PromptTokenizer,
        runtime: Box<dyn DistributedRuntime>,
        device: Device,
    ) -> Result<Self> {
        let world = runtime.world();

        let params = models.trainable_parameters();
        if params.is_empty() {
            return Err(TrainError::InvalidConfig("the assembled models have no trainable parameters".into()).into());
        }
        let optimizer = build_optimizer(&config)?;

        let dataset = DreamBoothDataset::new(&DreamBoothDatasetConfig::from_training_config(&config), tokenizer)?;
        let shuffle_seed = config.seed.unwrap_or(DEFAULT_SHUFFLE_SEED);
        let loader = DataLoader::new(Arc::new(dataset), config.train_batch_size, shuffle_seed, device.clone());

        let accumulation = config.gradient_accumulation_steps;
        let budget = StepBudget::before_prepare(
            loader.len(),
            accumulation,
            config.num_train_epochs,
            config.max_train_steps,
        );
        let schedule = build_lr_schedule(&config, &budget);

        let loader = loader.prepare(&world);
        let budget = budget.after_prepare(loader.len(), accumulation);

        let rng = match config.seed {
            Some(seed) => {
                let seed = seed.wrapping_add(world.process_index as u64);
                if let Err(e) = device.set_seed(seed) {
                    warn!("Could not seed the device RNG: {}", e);
                }
                StdRng::seed_from_u64(seed)
            }
            None => StdRng::from_entropy(),
        };

        let mut metrics = MetricsLogger::create(&config.logging_dir(), world.is_main_process())?;
        metrics.log_value(&serde_json::json!({
            "config": config.summary(),
            "unet_policy": models.unet.policy(),
        }))?;

        Ok(Self {
            config,
            models,
            loader,
            runtime,
            params,
            optimizer,
            schedule,
            budget,
            accumulator: GradientAccumulator::new(),
            metrics,
            hub: None,
            state: TrainingState::new(),
            rng,
            device,
        })
    }

    /// Publish the output directory through `hub` once training ends
    pub fn with_hub(mut self, hub: HubRepository) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn budget(&self) -> &StepBudget {
        &self.budget
    }

    pub fn schedule(&self) -> &ScheduleState {
        &self.schedule
    }

    pub fn optimizer(&self) -> &dyn ParamOptimizer {
        self.optimizer.as_ref()
    }

    pub fn trainable_parameters(&self) -> &[NamedVar] {
        &self.params
    }

    fn is_main_process(&self) -> bool {
        self.runtime.is_main_process()
    }

    fn log_banner(&self) {
        let world = self.runtime.world();
        let total_batch_size =
            self.config.train_batch_size * world.num_processes * self.config.gradient_accumulation_steps;
        let lines = [
            "***** Running training *****".to_string(),
            format!("  Num examples = {}", self.loader.dataset().len()),
            format!("  Num batches each epoch = {}", self.loader.len()),
            format!("  Num Epochs = {}", self.budget.num_train_epochs),
            format!("  Instantaneous batch size per device = {}", self.config.train_batch_size),
            format!("  Total train batch size (w. parallel, distributed & accumulation) = {}", total_batch_size),
            format!("  Gradient Accumulation steps = {}", self.config.gradient_accumulation_steps),
            format!("  Total optimization steps = {}", self.budget.max_train_steps),
            format!("  U-Net policy = {:?}", self.models.unet.policy()),
        ];
        for line in lines {
            if self.is_main_process() {
                info!("{}", line);
            } else {
                debug!("{}", line);
            }
        }
    }

    /// Restore from a checkpoint when asked to; a missing checkpoint starts a fresh run
    fn restore(&mut self) -> Result<()> {
        let Some(resume) = self.config.resume_from_checkpoint.clone() else {
            return Ok(());
        };

        match resolve_resume_checkpoint(&self.config.output_dir, &resume)? {
            Some((path, _)) => {
                info!("Resuming from checkpoint {}", path.display());
                let restored = load_checkpoint(
                    &path,
                    &self.params,
                    self.optimizer.as_mut(),
                    &mut self.schedule,
                    &self.device,
                )?;
                let point = ResumePoint::locate(restored.global_step, self.budget.num_update_steps_per_epoch);
                self.state.global_step = restored.global_step;
                self.state.first_epoch = point.first_epoch;
                self.state.current_epoch = point.first_epoch;
                self.state.resume_step = point.resume_step;
                self.state.resumed = true;
            }
            None => {
                warn!(
                    "Checkpoint '{:?}' does not exist in {}. Starting a new training run.",
                    resume,
                    self.config.output_dir.display()
                );
            }
        }
        Ok(())
    }

    /// Run every remaining epoch, then export the pipeline
    pub fn train(&mut self) -> Result<TrainingSummary> {
        self.restore()?;
        self.log_banner();
        self.state.phase = TrainingPhase::Running;

        let progress = StepProgress::new(
            self.budget.max_train_steps,
            self.state.global_step,
            self.runtime.is_local_main_process(),
        );
        let accumulation = self.config.gradient_accumulation_steps;
        let mut summary = TrainingSummary {
            global_step: self.state.global_step,
            micro_batches: 0,
            last_loss: None,
            checkpoints: Vec::new(),
            pipeline_dir: None,
            push: None,
        };

        let mut epoch = self.state.first_epoch;
        while epoch < self.budget.num_train_epochs && self.state.global_step < self.budget.max_train_steps {
            self.state.current_epoch = epoch;
            let batches = self.loader.epoch_batches(epoch);
            let num_batches = batches.len();
            let skip = if self.state.resumed && epoch == self.state.first_epoch {
                ResumePoint {
                    first_epoch: self.state.first_epoch,
                    resume_step: self.state.resume_step,
                }
                .micro_batches_to_skip(accumulation)
            } else {
                0
            };

            for (step, indices) in batches.iter().enumerate() {
                if step < skip {
                    continue;
                }

                let batch = self.loader.load_batch(indices, &mut self.rng)?;
                let loss = self.forward_backward(&batch)?;
                summary.micro_batches += 1;
                summary.last_loss = Some(loss);

                let lr = self.schedule.current_lr();
                self.schedule.step();
                let sync = (step + 1) % accumulation == 0 || step + 1 == num_batches;
                let mut grad_norm = None;
                if sync {
                    grad_norm = Some(self.apply_update(lr)?);
                    self.state.global_step += 1;
                    progress.advance(self.state.global_step);

                    if self.state.global_step % self.config.checkpointing_steps == 0 {
                        if let Some(path) = self.checkpoint()? {
                            summary.checkpoints.push(path);
                        }
                    }
                }

                progress.set_postfix(loss, lr);
                if self.is_main_process() {
                    self.metrics.log(&StepMetrics {
                        grad_norm,
                        ..StepMetrics::new(self.state.global_step, epoch, loss, lr)
                    })?;
                }

                if self.state.global_step >= self.budget.max_train_steps {
                    break;
                }
            }

            self.runtime.wait_for_everyone()?;
            epoch += 1;
        }
        progress.finish();
        self.metrics.flush()?;

        summary.global_step = self.state.global_step;
        let (pipeline_dir, push) = self.finish()?;
        summary.pipeline_dir = pipeline_dir;
        summary.push = push;
        Ok(summary)
    }

    /// One micro-batch: loss, backward, gradients into the accumulator.
    /// Returns the unscaled loss.
    fn forward_backward(&mut self, batch: &DreamBoothBatch) -> Result<f32> {
        let scheduler = &self.models.noise_scheduler;

        let latents = self.models.vae.encode_latents(&batch.pixel_values)?;
        let noise = latents.randn_like(0.0, 1.0)?;
        let bsz = latents.dim(0)?;
        let timesteps = scheduler.sample_timesteps(bsz, &mut self.rng, latents.device())?;
        let noisy_latents = scheduler.add_noise(&latents, &noise, &timesteps)?;
        let target = scheduler.training_target(&latents, &noise, &timesteps)?;

        let encoder_hidden_states = self.models.text_encoder.encode(&batch.input_ids)?;
        let model_pred = self
            .models
            .unet
            .predict(&noisy_latents, &timesteps, &encoder_hidden_states)?
            .to_dtype(DType::F32)?;
        let target = target.to_dtype(DType::F32)?;

        let loss = match &self.config.prior_preservation {
            Some(prior) if bsz > batch.num_instance => {
                let n = batch.num_instance;
                let instance_loss = candle_nn::loss::mse(&model_pred.narrow(0, 0, n)?, &target.narrow(0, 0, n)?)?;
                let prior_loss =
                    candle_nn::loss::mse(&model_pred.narrow(0, n, bsz - n)?, &target.narrow(0, n, bsz - n)?)?;
                (instance_loss + (prior_loss * prior.prior_loss_weight as f64)?)?
            }
            _ => candle_nn::loss::mse(&model_pred, &target)?,
        };

        let scaled = (&loss / self.config.gradient_accumulation_steps as f64)?;
        let grads = scaled.backward()?;
        self.accumulator.accumulate(&self.params, &grads)?;

        Ok(loss.to_scalar::<f32>()?)
    }

    /// Sync boundary: average across processes, clip, step. Returns the pre-clip norm.
    fn apply_update(&mut self, lr: f64) -> Result<f64> {
        let mut grads = self.accumulator.take();
        self.runtime.reduce_gradients(&mut grads)?;
        let grad_norm = clip_grad_norm(&mut grads, self.config.max_grad_norm)?;
        self.optimizer.set_lr(lr);
        self.optimizer.step(&self.params, &grads)?;
        Ok(grad_norm)
    }

    fn checkpoint(&mut self) -> Result<Option<PathBuf>> {
        if !self.is_main_process() {
            return Ok(None);
        }
        self.state.phase = TrainingPhase::Checkpointing;
        let path = save_checkpoint(
            &self.config.output_dir,
            self.state.global_step,
            self.state.current_epoch,
            &self.params,
            self.optimizer.as_ref(),
            &self.schedule,
        )?;
        self.state.phase = TrainingPhase::Running;
        Ok(Some(path))
    }

    /// Export on the main process and start the optional push
    fn finish(&mut self) -> Result<(Option<PathBuf>, Option<JoinHandle<()>>)> {
        let mut push = None;
        let pipeline_dir = if self.is_main_process() {
            let exporter = PipelineExporter::new(
                &self.config.pretrained_model_name_or_path,
                &self.config.output_dir,
                self.config.revision.as_deref(),
            );
            let dir = exporter.export(&self.params)?;
            if let Some(repo) = &self.hub {
                info!("Pushing {} to the hub in the background", repo.repo_id());
                push = Some(repo.push_in_background("End of training"));
            }
            Some(dir)
        } else {
            None
        };
        self.state.phase = TrainingPhase::Finished;
        info!("Training finished at step {}", self.state.global_step);
        Ok((pipeline_dir, push))
    }
}
