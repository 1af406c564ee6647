//! Resumable training state under `output_dir/checkpoint-<global_step>/`

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::config::ResumeFrom;
use super::error::TrainError;
use super::lr_scheduler::ScheduleState;
use super::optimizer::{NamedVar, ParamOptimizer};

pub const CHECKPOINT_PREFIX: &str = "checkpoint";
const TRAINABLE_FILE: &str = "trainable.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.safetensors";
const STATE_FILE: &str = "training_state.json";

pub fn checkpoint_dir_name(global_step: usize) -> String {
    format!("{}-{}", CHECKPOINT_PREFIX, global_step)
}

/// Global step encoded in a checkpoint directory name (`checkpoint-1500` → 1500)
pub fn parse_checkpoint_step(name: &str) -> Option<usize> {
    if !name.starts_with(CHECKPOINT_PREFIX) {
        return None;
    }
    name.split('-').nth(1)?.parse().ok()
}

/// Checkpoint with the highest step number, compared numerically
pub fn latest_checkpoint(output_dir: &Path) -> Result<Option<(PathBuf, usize)>> {
    if !output_dir.exists() {
        return Ok(None);
    }

    let mut latest: Option<(PathBuf, usize)> = None;
    let entries = fs::read_dir(output_dir)
        .with_context(|| format!("Failed to read output directory: {}", output_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(CHECKPOINT_PREFIX) {
            continue;
        }
        match parse_checkpoint_step(&name) {
            Some(step) => {
                if latest.as_ref().map_or(true, |(_, best)| step > *best) {
                    latest = Some((entry.path(), step));
                }
            }
            None => warn!("Ignoring {}: no step number in its name", name),
        }
    }
    Ok(latest)
}

/// Where to resume from, if anywhere. An explicit path is looked up by its
/// base name inside the output directory.
pub fn resolve_resume_checkpoint(output_dir: &Path, resume: &ResumeFrom) -> Result<Option<(PathBuf, usize)>> {
    let found = match resume {
        ResumeFrom::Latest => latest_checkpoint(output_dir)?,
        ResumeFrom::Path(path) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let dir = output_dir.join(&name);
            match parse_checkpoint_step(&name) {
                Some(step) if dir.is_dir() => Some((dir, step)),
                Some(_) => None,
                None => {
                    return Err(TrainError::InvalidConfig(format!(
                        "resume_from_checkpoint `{}` is not a checkpoint directory name",
                        path.display()
                    ))
                    .into())
                }
            }
        }
    };
    Ok(found)
}

/// Epoch and in-epoch position of a restored global step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub first_epoch: usize,
    /// Optimizer updates already done inside `first_epoch`
    pub resume_step: usize,
}

impl ResumePoint {
    pub fn locate(global_step: usize, num_update_steps_per_epoch: usize) -> Self {
        let steps = num_update_steps_per_epoch.max(1);
        Self {
            first_epoch: global_step / steps,
            resume_step: global_step % steps,
        }
    }

    /// Micro-batches of the first epoch to skip
    pub fn micro_batches_to_skip(&self, gradient_accumulation_steps: usize) -> usize {
        self.resume_step * gradient_accumulation_steps
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingStateFile {
    pub global_step: usize,
    pub epoch: usize,
    pub lr_scheduler_step: usize,
    pub learning_rate: f64,
    pub optimizer: String,
    pub optimizer_step: usize,
}

/// Write every piece of resumable state, replacing a checkpoint of the same step
pub fn save_checkpoint(
    output_dir: &Path,
    global_step: usize,
    epoch: usize,
    params: &[NamedVar],
    optimizer: &dyn ParamOptimizer,
    schedule: &ScheduleState,
) -> Result<PathBuf> {
    let checkpoint_dir = output_dir.join(checkpoint_dir_name(global_step));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir)
            .with_context(|| format!("Failed to replace checkpoint: {}", checkpoint_dir.display()))?;
    }
    fs::create_dir_all(&checkpoint_dir)?;

    let tensors: HashMap<String, Tensor> = params
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, checkpoint_dir.join(TRAINABLE_FILE))?;

    let state = optimizer.state_tensors()?;
    let mut metadata = HashMap::new();
    metadata.insert("optimizer_type".to_string(), optimizer.name().to_string());
    metadata.insert("optimizer_step".to_string(), optimizer.step_count().to_string());
    metadata.insert("learning_rate".to_string(), optimizer.learning_rate().to_string());
    safetensors::serialize_to_file(state.iter(), &Some(metadata), &checkpoint_dir.join(OPTIMIZER_FILE))
        .with_context(|| "Failed to write optimizer state")?;

    let training_state = TrainingStateFile {
        global_step,
        epoch,
        lr_scheduler_step: schedule.step_count(),
        learning_rate: schedule.current_lr(),
        optimizer: optimizer.name().to_string(),
        optimizer_step: optimizer.step_count(),
    };
    fs::write(
        checkpoint_dir.join(STATE_FILE),
        serde_json::to_string_pretty(&training_state)?,
    )?;

    info!("Saved state to {}", checkpoint_dir.display());
    Ok(checkpoint_dir)
}

/// Restore parameters, optimizer moments and schedule position in place
pub fn load_checkpoint(
    checkpoint_dir: &Path,
    params: &[NamedVar],
    optimizer: &mut dyn ParamOptimizer,
    schedule: &mut ScheduleState,
    device: &Device,
) -> Result<TrainingStateFile> {
    let state_path = checkpoint_dir.join(STATE_FILE);
    let training_state: TrainingStateFile = serde_json::from_str(
        &fs::read_to_string(&state_path)
            .with_context(|| format!("Failed to read {}", state_path.display()))?,
    )
    .with_context(|| format!("Failed to parse {}", state_path.display()))?;

    if training_state.optimizer != optimizer.name() {
        return Err(TrainError::InvalidConfig(format!(
            "checkpoint {} was written by the {} optimizer but this run uses {}",
            checkpoint_dir.display(),
            training_state.optimizer,
            optimizer.name()
        ))
        .into());
    }

    let tensors = candle_core::safetensors::load(checkpoint_dir.join(TRAINABLE_FILE), device)?;
    for (name, var) in params {
        let tensor = tensors
            .get(name)
            .with_context(|| format!("checkpoint has no value for {}", name))?;
        var.set(&tensor.to_dtype(var.dtype())?)
            .with_context(|| format!("Failed to restore {}", name))?;
    }

    let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILE);
    let buffer = fs::read(&optimizer_path)
        .with_context(|| format!("Failed to read {}", optimizer_path.display()))?;
    let (_, metadata) = safetensors::SafeTensors::read_metadata(&buffer)
        .with_context(|| format!("Failed to parse {}", optimizer_path.display()))?;
    let optimizer_step = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get("optimizer_step"))
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(training_state.optimizer_step);
    let optimizer_state = candle_core::safetensors::load_buffer(&buffer, device)?;
    optimizer.load_state_tensors(optimizer_state, optimizer_step)?;

    schedule.set_step_count(training_state.lr_scheduler_step);
    Ok(training_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::lr_scheduler::{create_scheduler, LrSchedulerKind};
    use crate::trainers::optimizer::{create_optimizer, AdamParams};
    use candle_core::Var;

    fn adam() -> Box<dyn ParamOptimizer> {
        create_optimizer(
            AdamParams {
                learning_rate: 0.1,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                weight_decay: 0.0,
            },
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_latest_is_numeric_not_lexical() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["checkpoint-10", "checkpoint-2", "checkpoint-100", "logs"] {
            fs::create_dir_all(dir.path().join(name))?;
        }
        let (path, step) = latest_checkpoint(dir.path())?.unwrap();
        assert_eq!(step, 100);
        assert_eq!(path.file_name().unwrap(), "checkpoint-100");
        Ok(())
    }

    #[test]
    fn test_no_checkpoints() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(latest_checkpoint(dir.path())?.is_none());
        assert!(latest_checkpoint(&dir.path().join("missing"))?.is_none());
        Ok(())
    }

    #[test]
    fn test_explicit_path_uses_base_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("checkpoint-40"))?;
        let resume = ResumeFrom::Path(PathBuf::from("/elsewhere/checkpoint-40"));
        let (path, step) = resolve_resume_checkpoint(dir.path(), &resume)?.unwrap();
        assert_eq!(step, 40);
        assert_eq!(path, dir.path().join("checkpoint-40"));

        let missing = ResumeFrom::Path(PathBuf::from("checkpoint-41"));
        assert!(resolve_resume_checkpoint(dir.path(), &missing)?.is_none());

        let bogus = ResumeFrom::Path(PathBuf::from("final"));
        assert!(resolve_resume_checkpoint(dir.path(), &bogus).is_err());
        Ok(())
    }

    #[test]
    fn test_resume_point_recovers_mid_epoch() {
        for (g, s) in [(0, 3), (5, 3), (6, 3), (1234, 100), (7, 1)] {
            let point = ResumePoint::locate(g, s);
            assert_eq!((point.first_epoch, point.resume_step), (g / s, g % s));
        }
        assert_eq!(ResumePoint::locate(5, 3).micro_batches_to_skip(4), 8);
    }

    #[test]
    fn test_save_and_load_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let var = Var::new(&[1.0f32, 2.0, 3.0], &device)?;
        let params = vec![("unet.w".to_string(), var.clone())];

        let mut optimizer = adam();
        let mut grads = HashMap::new();
        grads.insert("unet.w".to_string(), Tensor::new(&[0.1f32, 0.2, 0.3], &device)?);
        optimizer.step(&params, &grads)?;
        let mut schedule = ScheduleState::new(create_scheduler(LrSchedulerKind::Constant, 0.1, 0, 10, 1, 1.0));
        schedule.step();
        schedule.step();

        let saved_values = var.as_tensor().to_vec1::<f32>()?;
        let path = save_checkpoint(dir.path(), 7, 1, &params, optimizer.as_ref(), &schedule)?;
        assert_eq!(path, dir.path().join("checkpoint-7"));

        // Saving the same step again replaces the directory
        save_checkpoint(dir.path(), 7, 1, &params, optimizer.as_ref(), &schedule)?;
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);

        var.set(&Tensor::zeros(3, candle_core::DType::F32, &device)?)?;
        let mut restored_optimizer = adam();
        let mut restored_schedule =
            ScheduleState::new(create_scheduler(LrSchedulerKind::Constant, 0.1, 0, 10, 1, 1.0));
        let state = load_checkpoint(&path, &params, restored_optimizer.as_mut(), &mut restored_schedule, &device)?;

        assert_eq!(state.global_step, 7);
        assert_eq!(state.epoch, 1);
        assert_eq!(restored_schedule.step_count(), 2);
        assert_eq!(restored_optimizer.step_count(), 1);
        assert_eq!(var.as_tensor().to_vec1::<f32>()?, saved_values);
        assert!(restored_optimizer.state_tensors()?.contains_key("unet.w.exp_avg"));
        Ok(())
    }
}
