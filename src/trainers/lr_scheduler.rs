//! Learning-rate schedules
//!
//! Every schedule is a multiplier on the base learning rate evaluated at the
//! number of scheduler steps taken so far, matching the warmup/decay shapes the
//! diffusers training scripts use.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerKind {
    #[value(name = "linear")]
    Linear,
    #[value(name = "cosine")]
    Cosine,
    #[value(name = "cosine_with_restarts")]
    CosineWithRestarts,
    #[value(name = "polynomial")]
    Polynomial,
    #[value(name = "constant")]
    Constant,
    #[value(name = "constant_with_warmup")]
    ConstantWithWarmup,
}

/// Learning rate scheduler trait
pub trait LRScheduler: Send {
    fn get_lr(&self, step: usize) -> f64;
}

/// Create a learning rate scheduler
pub fn create_scheduler(
    kind: LrSchedulerKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    num_cycles: usize,
    power: f64,
) -> Box<dyn LRScheduler> {
    match kind {
        LrSchedulerKind::Constant => Box::new(ConstantScheduler::new(base_lr, 0)),
        LrSchedulerKind::ConstantWithWarmup => Box::new(ConstantScheduler::new(base_lr, warmup_steps)),
        LrSchedulerKind::Linear => Box::new(LinearScheduler::new(base_lr, warmup_steps, total_steps)),
        // Plain cosine decays over half a period; only the restart variant uses the cycle count
        LrSchedulerKind::Cosine => Box::new(CosineScheduler::new(base_lr, warmup_steps, total_steps, 0.5)),
        LrSchedulerKind::CosineWithRestarts => Box::new(CosineWithRestartsScheduler::new(
            base_lr,
            warmup_steps,
            total_steps,
            num_cycles,
        )),
        LrSchedulerKind::Polynomial => Box::new(PolynomialScheduler::new(base_lr, warmup_steps, total_steps, power)),
    }
}

fn warmup_factor(step: usize, warmup_steps: usize) -> f64 {
    step as f64 / warmup_steps.max(1) as f64
}

fn decay_progress(step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    (step - warmup_steps) as f64 / total_steps.saturating_sub(warmup_steps).max(1) as f64
}

struct ConstantScheduler {
    lr: f64,
    warmup_steps: usize,
}

impl ConstantScheduler {
    fn new(lr: f64, warmup_steps: usize) -> Self {
        Self { lr, warmup_steps }
    }
}

impl LRScheduler for ConstantScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            self.lr * warmup_factor(step, self.warmup_steps)
        } else {
            self.lr
        }
    }
}

struct LinearScheduler {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearScheduler {
    fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self { base_lr, warmup_steps, total_steps }
    }
}

impl LRScheduler for LinearScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * warmup_factor(step, self.warmup_steps);
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        self.base_lr * (remaining / span).max(0.0)
    }
}

struct CosineScheduler {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    num_cycles: f64,
}

impl CosineScheduler {
    fn new(base_lr: f64, warmup_steps: usize, total_steps: usize, num_cycles: f64) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            num_cycles,
        }
    }
}

impl LRScheduler for CosineScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * warmup_factor(step, self.warmup_steps);
        }
        let progress = decay_progress(step, self.warmup_steps, self.total_steps);
        let cosine = 0.5 * (1.0 + (PI * self.num_cycles * 2.0 * progress).cos());
        self.base_lr * cosine.max(0.0)
    }
}

struct CosineWithRestartsScheduler {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    num_cycles: usize,
}

impl CosineWithRestartsScheduler {
    fn new(base_lr: f64, warmup_steps: usize, total_steps: usize, num_cycles: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            num_cycles,
        }
    }
}

impl LRScheduler for CosineWithRestartsScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * warmup_factor(step, self.warmup_steps);
        }
        let progress = decay_progress(step, self.warmup_steps, self.total_steps);
        if progress >= 1.0 {
            return 0.0;
        }
        let phase = (self.num_cycles as f64 * progress) % 1.0;
        self.base_lr * (0.5 * (1.0 + (PI * phase).cos())).max(0.0)
    }
}

struct PolynomialScheduler {
    base_lr: f64,
    lr_end: f64,
    warmup_steps: usize,
    total_steps: usize,
    power: f64,
}

impl PolynomialScheduler {
    fn new(base_lr: f64, warmup_steps: usize, total_steps: usize, power: f64) -> Self {
        Self {
            base_lr,
            lr_end: 1e-7,
            warmup_steps,
            total_steps,
            power,
        }
    }
}

impl LRScheduler for PolynomialScheduler {
    fn get_lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * warmup_factor(step, self.warmup_steps);
        }
        if step > self.total_steps || self.base_lr <= self.lr_end {
            return self.lr_end;
        }
        let remaining = 1.0 - decay_progress(step, self.warmup_steps, self.total_steps);
        (self.base_lr - self.lr_end) * remaining.powf(self.power) + self.lr_end
    }
}

/// A schedule plus the number of steps it has been advanced
pub struct ScheduleState {
    scheduler: Box<dyn LRScheduler>,
    step: usize,
}

impl ScheduleState {
    pub fn new(scheduler: Box<dyn LRScheduler>) -> Self {
        Self { scheduler, step: 0 }
    }

    /// Learning rate for the update about to happen
    pub fn current_lr(&self) -> f64 {
        self.scheduler.get_lr(self.step)
    }

    pub fn step(&mut self) {
        self.step += 1;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Restore the position after loading a checkpoint
    pub fn set_step_count(&mut self, step: usize) {
        self.step = step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_constant_ignores_warmup() {
        let s = create_scheduler(LrSchedulerKind::Constant, 1e-4, 100, 1000, 1, 1.0);
        assert!(close(s.get_lr(0), 1e-4));
        assert!(close(s.get_lr(999), 1e-4));
    }

    #[test]
    fn test_constant_with_warmup() {
        let s = create_scheduler(LrSchedulerKind::ConstantWithWarmup, 1.0, 10, 100, 1, 1.0);
        assert!(close(s.get_lr(0), 0.0));
        assert!(close(s.get_lr(5), 0.5));
        assert!(close(s.get_lr(10), 1.0));
        assert!(close(s.get_lr(90), 1.0));
    }

    #[test]
    fn test_linear_decays_to_zero() {
        let s = create_scheduler(LrSchedulerKind::Linear, 1.0, 10, 110, 1, 1.0);
        assert!(close(s.get_lr(10), 1.0));
        assert!(close(s.get_lr(60), 0.5));
        assert!(close(s.get_lr(110), 0.0));
        assert!(close(s.get_lr(200), 0.0));
    }

    #[test]
    fn test_cosine_half_period() {
        let s = create_scheduler(LrSchedulerKind::Cosine, 1.0, 0, 100, 7, 1.0);
        assert!(close(s.get_lr(0), 1.0));
        assert!(close(s.get_lr(50), 0.5));
        assert!(s.get_lr(100) < 1e-9);
    }

    #[test]
    fn test_cosine_with_restarts() {
        let s = create_scheduler(LrSchedulerKind::CosineWithRestarts, 1.0, 0, 100, 2, 1.0);
        assert!(close(s.get_lr(0), 1.0));
        assert!(close(s.get_lr(25), 0.5));
        // Second cycle restarts at full learning rate
        assert!(close(s.get_lr(50), 1.0));
        assert!(close(s.get_lr(100), 0.0));
    }

    #[test]
    fn test_polynomial_power() {
        let s = create_scheduler(LrSchedulerKind::Polynomial, 1.0, 0, 100, 1, 2.0);
        let expected = (1.0 - 1e-7) * 0.25 + 1e-7;
        assert!(close(s.get_lr(50), expected));
        assert!(close(s.get_lr(150), 1e-7));
    }

    #[test]
    fn test_schedule_state_tracks_steps() {
        let mut state = ScheduleState::new(create_scheduler(LrSchedulerKind::Linear, 1.0, 0, 4, 1, 1.0));
        assert!(close(state.current_lr(), 1.0));
        state.step();
        state.step();
        assert_eq!(state.step_count(), 2);
        assert!(close(state.current_lr(), 0.5));
        state.set_step_count(4);
        assert!(close(state.current_lr(), 0.0));
    }
}
