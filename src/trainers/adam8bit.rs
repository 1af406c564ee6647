//! 8-bit AdamW optimizer for memory-efficient training
//! Stores optimizer states in 8-bit format to reduce memory usage

use anyhow::Result;
use candle_core::{DType, Tensor};
use std::collections::HashMap;

use super::optimizer::{group_moments, NamedVar, ParamOptimizer};

/// Zero point of the signed first-moment code
const M_ZERO: f64 = 128.0;
const Q_MAX: f64 = 255.0;

pub struct Adam8bit {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,

    // 8-bit quantized states
    m_quantized: HashMap<String, QuantizedTensor>,
    v_quantized: HashMap<String, QuantizedTensor>,

    // Step counter
    step: usize,
}

/// Quantized tensor with scale factor
#[derive(Clone)]
pub struct QuantizedTensor {
    pub data: Tensor, // u8 tensor
    pub scale: f32,   // Scale factor for dequantization
}

impl Adam8bit {
    pub fn new(learning_rate: f64) -> Self {
        Self::with_params(learning_rate, 0.9, 0.999, 1e-8, 0.0)
    }

    pub fn with_params(learning_rate: f64, beta1: f64, beta2: f64, eps: f64, weight_decay: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            eps,
            weight_decay,
            m_quantized: HashMap::new(),
            v_quantized: HashMap::new(),
            step: 0,
        }
    }

    /// First moment: signed, stored around a zero point of 128
    fn quantize_signed(tensor: &Tensor) -> Result<QuantizedTensor> {
        let tensor = tensor.to_dtype(DType::F32)?;
        let abs_max = tensor.abs()?.max_all()?.to_scalar::<f32>()?;
        let scale = if abs_max > 0.0 { abs_max / 127.0 } else { 1.0 };

        let data = ((tensor / scale as f64)?.round()? + M_ZERO)?
            .clamp(0.0, Q_MAX)?
            .to_dtype(DType::U8)?;
        Ok(QuantizedTensor { data, scale })
    }

    fn dequantize_signed(quant: &QuantizedTensor) -> Result<Tensor> {
        let float_data = quant.data.to_dtype(DType::F32)?;
        Ok(((float_data - M_ZERO)? * quant.scale as f64)?)
    }

    /// Second moment: kept as its square root and rounded up, so the update
    /// denominator never shrinks through quantization
    fn quantize_second_moment(tensor: &Tensor) -> Result<QuantizedTensor> {
        let root = tensor.to_dtype(DType::F32)?.clamp(0.0, f64::INFINITY)?.sqrt()?;
        let max = root.max_all()?.to_scalar::<f32>()?;
        let scale = if max > 0.0 { max / Q_MAX as f32 } else { 1.0 };

        let data = (root / scale as f64)?.ceil()?.clamp(0.0, Q_MAX)?.to_dtype(DType::U8)?;
        Ok(QuantizedTensor { data, scale })
    }

    fn dequantize_second_moment(quant: &QuantizedTensor) -> Result<Tensor> {
        let root = (quant.data.to_dtype(DType::F32)? * quant.scale as f64)?;
        Ok(root.sqr()?)
    }

    /// Update a single parameter
    fn update(&mut self, name: &str, param: &candle_core::Var, grad: &Tensor) -> Result<()> {
        let grad_f32 = grad.to_dtype(DType::F32)?;

        let (m, v) = match (self.m_quantized.get(name), self.v_quantized.get(name)) {
            (Some(m), Some(v)) => (Self::dequantize_signed(m)?, Self::dequantize_second_moment(v)?),
            _ => (grad_f32.zeros_like()?, grad_f32.zeros_like()?),
        };

        // Update biased first moment estimate
        let m_new = ((m * self.beta1)? + (&grad_f32 * (1.0 - self.beta1))?)?;

        // Update biased second raw moment estimate
        let v_new = ((v * self.beta2)? + (grad_f32.sqr()? * (1.0 - self.beta2))?)?;

        // Quantize and store updated states
        self.m_quantized.insert(name.to_string(), Self::quantize_signed(&m_new)?);
        self.v_quantized.insert(name.to_string(), Self::quantize_second_moment(&v_new)?);

        // Bias correction uses the full precision values of this step
        let step = self.step.max(1) as i32;
        let m_hat = (m_new / (1.0 - self.beta1.powi(step)))?;
        let v_hat = (v_new / (1.0 - self.beta2.powi(step)))?;
        let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;

        let theta = param.as_tensor().to_dtype(DType::F32)?;
        let theta = (theta * (1.0 - self.learning_rate * self.weight_decay))?;
        let theta = (theta - (update * self.learning_rate)?)?;

        param.set(&theta.to_dtype(param.dtype())?)?;
        Ok(())
    }

    /// Get memory usage statistics
    pub fn memory_stats(&self) -> (usize, usize) {
        let num_params = self.m_quantized.len();
        let total_elements: usize = self.m_quantized.values().map(|m| m.data.elem_count()).sum();

        // One byte per element for each of the two moments, plus two f32 scales per parameter
        let memory_bytes = total_elements * 2 + num_params * 8;
        (num_params, memory_bytes)
    }
}

impl ParamOptimizer for Adam8bit {
    fn name(&self) -> &'static str {
        "adam8bit"
    }

    fn set_lr(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn step(&mut self, params: &[NamedVar], grads: &HashMap<String, Tensor>) -> Result<()> {
        self.step += 1;
        for (name, param) in params {
            if let Some(grad) = grads.get(name) {
                self.update(name, param, grad)?;
            }
        }
        Ok(())
    }

    fn step_count(&self) -> usize {
        self.step
    }

    fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for (name, m_quant) in &self.m_quantized {
            if let Some(v_quant) = self.v_quantized.get(name) {
                state.insert(format!("{}.exp_avg", name), Self::dequantize_signed(m_quant)?);
                state.insert(format!("{}.exp_avg_sq", name), Self::dequantize_second_moment(v_quant)?);
            }
        }
        Ok(state)
    }

    fn load_state_tensors(&mut self, state: HashMap<String, Tensor>, step: usize) -> Result<()> {
        self.m_quantized.clear();
        self.v_quantized.clear();

        for (name, (m, v)) in group_moments(state)? {
            self.m_quantized.insert(name.clone(), Self::quantize_signed(&m)?);
            self.v_quantized.insert(name, Self::quantize_second_moment(&v)?);
        }
        self.step = step;
        Ok(())
    }
}
