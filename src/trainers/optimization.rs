//! Optimizer, learning-rate schedule and step budget for a training run

use anyhow::Result;
use log::info;

use super::config::TrainingConfig;
use super::lr_scheduler::{create_scheduler, ScheduleState};
use super::optimizer::{create_optimizer, AdamParams, ParamOptimizer};

/// How many optimizer updates the run performs and over how many epochs.
///
/// Computed twice: once from the unsharded data loader to size the learning
/// rate schedule, and again once the loader has been split across processes,
/// because only then is the real number of batches per epoch known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBudget {
    pub num_update_steps_per_epoch: usize,
    pub max_train_steps: usize,
    pub num_train_epochs: usize,
    overrode_max_train_steps: bool,
}

impl StepBudget {
    /// First pass, before the data loader is wrapped for distributed execution
    pub fn before_prepare(
        batches_per_epoch: usize,
        gradient_accumulation_steps: usize,
        num_train_epochs: usize,
        max_train_steps: Option<usize>,
    ) -> Self {
        let num_update_steps_per_epoch = batches_per_epoch.div_ceil(gradient_accumulation_steps);
        let (max_train_steps, overrode_max_train_steps) = match max_train_steps {
            Some(steps) => (steps, false),
            None => (num_train_epochs * num_update_steps_per_epoch, true),
        };
        Self {
            num_update_steps_per_epoch,
            max_train_steps,
            num_train_epochs,
            overrode_max_train_steps,
        }
    }

    /// Second pass, with the length of the sharded data loader
    pub fn after_prepare(self, batches_per_epoch: usize, gradient_accumulation_steps: usize) -> Self {
        let num_update_steps_per_epoch = batches_per_epoch.div_ceil(gradient_accumulation_steps).max(1);
        let max_train_steps = if self.overrode_max_train_steps {
            self.num_train_epochs * num_update_steps_per_epoch
        } else {
            self.max_train_steps
        };
        let num_train_epochs = max_train_steps.div_ceil(num_update_steps_per_epoch);
        Self {
            num_update_steps_per_epoch,
            max_train_steps,
            num_train_epochs,
            overrode_max_train_steps: self.overrode_max_train_steps,
        }
    }

    pub fn overrode_max_train_steps(&self) -> bool {
        self.overrode_max_train_steps
    }
}

pub fn adam_params(config: &TrainingConfig) -> AdamParams {
    AdamParams {
        learning_rate: config.learning_rate,
        beta1: config.adam_beta1,
        beta2: config.adam_beta2,
        eps: config.adam_epsilon,
        weight_decay: config.adam_weight_decay,
    }
}

pub fn build_optimizer(config: &TrainingConfig) -> Result<Box<dyn ParamOptimizer>> {
    let optimizer = create_optimizer(adam_params(config), config.use_8bit_adam)?;
    info!("Optimizer: {} (lr {:.2e})", optimizer.name(), config.learning_rate);
    Ok(optimizer)
}

/// The schedule advances once per micro-batch, so its lengths are in micro-batches
pub fn build_lr_schedule(config: &TrainingConfig, budget: &StepBudget) -> ScheduleState {
    let accumulation = config.gradient_accumulation_steps;
    ScheduleState::new(create_scheduler(
        config.lr_scheduler,
        config.learning_rate,
        config.lr_warmup_steps * accumulation,
        budget.max_train_steps * accumulation,
        config.lr_num_cycles,
        config.lr_power,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_from_epochs() {
        let budget = StepBudget::before_prepare(10, 2, 3, None);
        assert_eq!(budget.num_update_steps_per_epoch, 5);
        assert_eq!(budget.max_train_steps, 15);
        assert!(budget.overrode_max_train_steps());
    }

    #[test]
    fn test_second_pass_after_sharding() {
        // 10 batches over 2 processes leaves 5 per process
        let budget = StepBudget::before_prepare(10, 2, 3, None).after_prepare(5, 2);
        assert_eq!(budget.num_update_steps_per_epoch, 3);
        assert_eq!(budget.max_train_steps, 9);
        assert_eq!(budget.num_train_epochs, 3);
    }

    #[test]
    fn test_explicit_max_steps_sets_epochs() {
        let budget = StepBudget::before_prepare(10, 2, 1, Some(7)).after_prepare(5, 2);
        assert_eq!(budget.max_train_steps, 7);
        assert_eq!(budget.num_train_epochs, 3);
        assert!(!budget.overrode_max_train_steps());
    }

    #[test]
    fn test_five_steps_over_three_batch_epochs() {
        let budget = StepBudget::before_prepare(3, 1, 1, Some(5)).after_prepare(3, 1);
        assert_eq!(budget.num_update_steps_per_epoch, 3);
        assert_eq!(budget.num_train_epochs, 2);
    }
}
