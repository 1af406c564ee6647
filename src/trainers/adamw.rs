//! AdamW with decoupled weight decay and f32 moment estimates

use anyhow::Result;
use candle_core::{DType, Tensor};
use std::collections::HashMap;

use super::optimizer::{group_moments, AdamParams, NamedVar, ParamOptimizer};

pub struct AdamW {
    params: AdamParams,
    moments: HashMap<String, (Tensor, Tensor)>,
    step: usize,
}

impl AdamW {
    pub fn new(params: AdamParams) -> Self {
        Self {
            params,
            moments: HashMap::new(),
            step: 0,
        }
    }
}

impl ParamOptimizer for AdamW {
    fn name(&self) -> &'static str {
        "adamw"
    }

    fn set_lr(&mut self, lr: f64) {
        self.params.learning_rate = lr;
    }

    fn learning_rate(&self) -> f64 {
        self.params.learning_rate
    }

    fn step(&mut self, params: &[NamedVar], grads: &HashMap<String, Tensor>) -> Result<()> {
        self.step += 1;
        let AdamParams {
            learning_rate: lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let bias_correction1 = 1.0 - beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step as i32);

        for (name, param) in params {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            let theta = param.as_tensor().to_dtype(DType::F32)?;

            let (m, v) = match self.moments.remove(name) {
                Some(state) => state,
                None => (grad.zeros_like()?, grad.zeros_like()?),
            };
            let m = ((m * beta1)? + (&grad * (1.0 - beta1))?)?;
            let v = ((v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&m / bias_correction1)?;
            let v_hat = (&v / bias_correction2)?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;

            let theta = (theta * (1.0 - lr * weight_decay))?;
            let theta = (theta - (update * lr)?)?;
            param.set(&theta.to_dtype(param.dtype())?)?;

            self.moments.insert(name.clone(), (m, v));
        }
        Ok(())
    }

    fn step_count(&self) -> usize {
        self.step
    }

    fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for (name, (m, v)) in &self.moments {
            state.insert(format!("{}.exp_avg", name), m.clone());
            state.insert(format!("{}.exp_avg_sq", name), v.clone());
        }
        Ok(state)
    }

    fn load_state_tensors(&mut self, state: HashMap<String, Tensor>, step: usize) -> Result<()> {
        self.moments.clear();
        for (name, (m, v)) in group_moments(state)? {
            self.moments.insert(name, (m.to_dtype(DType::F32)?, v.to_dtype(DType::F32)?));
        }
        self.step = step;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn test_weight_decay_is_decoupled() -> Result<()> {
        let var = Var::new(&[2.0f32], &Device::Cpu)?;
        let params = vec![("w".to_string(), var.clone())];
        let mut opt = AdamW::new(AdamParams {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.5,
        });

        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Tensor::new(&[0.0f32], &Device::Cpu)?);
        opt.step(&params, &grads)?;

        // Zero gradient: only the decay term moves the weight
        let w = var.as_tensor().to_vec1::<f32>()?[0];
        assert!((w - 2.0 * (1.0 - 0.05)).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_state_round_trip() -> Result<()> {
        let var = Var::new(&[1.0f32, -1.0], &Device::Cpu)?;
        let params = vec![("w".to_string(), var.clone())];
        let mut opt = AdamW::new(AdamParams {
            learning_rate: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        });
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Tensor::new(&[0.5f32, -0.5], &Device::Cpu)?);
        opt.step(&params, &grads)?;

        let state = opt.state_tensors()?;
        assert!(state.contains_key("w.exp_avg"));
        assert!(state.contains_key("w.exp_avg_sq"));

        let mut restored = AdamW::new(opt.params);
        restored.load_state_tensors(state, opt.step_count())?;
        assert_eq!(restored.step_count(), 1);
        let m = restored.state_tensors()?["w.exp_avg"].to_vec1::<f32>()?;
        assert!((m[0] - 0.05).abs() < 1e-6);
        Ok(())
    }
}
