//! Optimizer seam shared by the standard and 8-bit AdamW implementations,
//! plus gradient accumulation and global-norm clipping

use anyhow::{Context, Result};
use candle_core::{DType, Tensor, Var};
use std::collections::HashMap;

use super::adamw::AdamW;
use super::error::TrainError;

/// Named trainable variable, e.g. `unet.conv_in.weight`
pub type NamedVar = (String, Var);

pub trait ParamOptimizer: Send {
    fn name(&self) -> &'static str;

    fn set_lr(&mut self, lr: f64);

    fn learning_rate(&self) -> f64;

    /// Apply one update to every parameter that has a gradient
    fn step(&mut self, params: &[NamedVar], grads: &HashMap<String, Tensor>) -> Result<()>;

    /// Number of updates applied so far
    fn step_count(&self) -> usize;

    /// Moment estimates keyed `<param>.exp_avg` / `<param>.exp_avg_sq`, in f32
    fn state_tensors(&self) -> Result<HashMap<String, Tensor>>;

    fn load_state_tensors(&mut self, state: HashMap<String, Tensor>, step: usize) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct AdamParams {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

/// Pick the optimizer implementation
pub fn create_optimizer(params: AdamParams, use_8bit: bool) -> Result<Box<dyn ParamOptimizer>> {
    if !use_8bit {
        return Ok(Box::new(AdamW::new(params)));
    }

    #[cfg(feature = "adam8bit")]
    {
        Ok(Box::new(super::adam8bit::Adam8bit::with_params(
            params.learning_rate,
            params.beta1,
            params.beta2,
            params.eps,
            params.weight_decay,
        )))
    }

    #[cfg(not(feature = "adam8bit"))]
    {
        Err(TrainError::MissingOptionalDependency {
            feature: "8-bit Adam",
            hint: "rebuild with `cargo build --features adam8bit` to use --use_8bit_adam",
        }
        .into())
    }
}

/// Split `<param>.exp_avg` / `<param>.exp_avg_sq` entries back into pairs
pub fn group_moments(mut state: HashMap<String, Tensor>) -> Result<HashMap<String, (Tensor, Tensor)>> {
    let names: Vec<String> = state
        .keys()
        .filter_map(|k| k.strip_suffix(".exp_avg").map(str::to_string))
        .collect();

    let mut grouped = HashMap::new();
    for name in names {
        let m = state
            .remove(&format!("{}.exp_avg", name))
            .with_context(|| format!("missing first moment for {}", name))?;
        let v = state
            .remove(&format!("{}.exp_avg_sq", name))
            .with_context(|| format!("missing second moment for {}", name))?;
        grouped.insert(name, (m, v));
    }

    if let Some(orphan) = state.keys().next() {
        return Err(TrainError::InvalidConfig(format!("unexpected optimizer state entry {}", orphan)).into());
    }
    Ok(grouped)
}

/// Sums micro-batch gradients until the next sync boundary
pub struct GradientAccumulator {
    accumulated_grads: HashMap<String, Tensor>,
    micro_steps: usize,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self {
            accumulated_grads: HashMap::new(),
            micro_steps: 0,
        }
    }

    /// Pull the gradient of every trainable variable out of a backward pass
    pub fn accumulate(&mut self, params: &[NamedVar], grads: &candle_core::backprop::GradStore) -> Result<()> {
        for (name, var) in params {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let grad = grad.to_dtype(DType::F32)?;
                match self.accumulated_grads.get_mut(name) {
                    Some(acc) => *acc = (&*acc + &grad)?,
                    None => {
                        self.accumulated_grads.insert(name.clone(), grad);
                    }
                }
            }
        }
        self.micro_steps += 1;
        Ok(())
    }

    pub fn micro_steps(&self) -> usize {
        self.micro_steps
    }

    pub fn take(&mut self) -> HashMap<String, Tensor> {
        self.micro_steps = 0;
        std::mem::take(&mut self.accumulated_grads)
    }
}

impl Default for GradientAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Scale gradients in place so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut HashMap<String, Tensor>, max_norm: f64) -> Result<f64> {
    let mut total_sq = 0f64;
    for grad in grads.values() {
        total_sq += grad.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    }
    let total_norm = total_sq.sqrt();

    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        for grad in grads.values_mut() {
            *grad = (&*grad * clip_coef)?;
        }
    }
    Ok(total_norm)
}
