//! Locating diffusers component weights and loading them as frozen tensors or
//! trainable variables

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use log::debug;
use std::path::{Path, PathBuf};

use crate::trainers::optimizer::NamedVar;

const WEIGHT_FILES: [&str; 2] = ["diffusion_pytorch_model.safetensors", "model.safetensors"];

/// Safetensors file of a pipeline component, e.g. `<model>/unet/diffusion_pytorch_model.safetensors`
pub fn component_weights(model_dir: &Path, component: &str) -> Result<PathBuf> {
    let dir = model_dir.join(component);
    WEIGHT_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
        .with_context(|| format!("No safetensors weights found for {} in {}", component, dir.display()))
}

pub fn read_component_config<T: serde::de::DeserializeOwned>(model_dir: &Path, component: &str) -> Result<T> {
    let path = model_dir.join(component).join("config.json");
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Memory-mapped, read-only weights cast to `dtype`
pub fn frozen_var_builder(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    // Safety: the file is not modified while training runs
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? };
    Ok(vb)
}

/// Variables of a trainable model, named `<prefix>.<tensor name>`
pub struct TrainableWeights {
    varmap: VarMap,
    prefix: &'static str,
}

impl TrainableWeights {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            varmap: VarMap::new(),
            prefix,
        }
    }

    /// Builder that registers every tensor the model asks for as an f32 variable
    pub fn var_builder(&self, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, device)
    }

    /// Overwrite every registered variable with its pretrained value
    pub fn init_from(&self, path: &Path, device: &Device) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("variable map lock poisoned"))?;
        for (name, var) in vars.iter() {
            let tensor = tensors
                .get(name)
                .with_context(|| format!("{} has no tensor named {}", path.display(), name))?;
            var.set(&tensor.to_dtype(var.dtype())?)
                .with_context(|| format!("Failed to initialise {}", name))?;
        }
        debug!("Initialised {} {} variables from {}", vars.len(), self.prefix, path.display());
        Ok(())
    }

    /// Sorted by name so checkpoints and optimizer state line up across runs
    pub fn named_vars(&self) -> Vec<NamedVar> {
        let mut named: Vec<NamedVar> = match self.varmap.data().lock() {
            Ok(vars) => vars
                .iter()
                .map(|(name, var)| (format!("{}.{}", self.prefix, name), var.clone()))
                .collect(),
            Err(_) => Vec::new(),
        };
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }
}

/// Strip the `<prefix>.` namespace added by [`TrainableWeights::named_vars`]
pub fn unprefixed<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    name.strip_prefix(prefix)?.strip_prefix('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use std::collections::HashMap;

    #[test]
    fn test_prefers_diffusers_file_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("unet"))?;
        std::fs::write(dir.path().join("unet/model.safetensors"), b"")?;
        assert!(component_weights(dir.path(), "unet")?.ends_with("model.safetensors"));
        std::fs::write(dir.path().join("unet/diffusion_pytorch_model.safetensors"), b"")?;
        assert!(component_weights(dir.path(), "unet")?.ends_with("diffusion_pytorch_model.safetensors"));
        assert!(component_weights(dir.path(), "vae").is_err());
        Ok(())
    }

    #[test]
    fn test_trainable_weights_load_pretrained_values() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let device = Device::Cpu;
        let path = dir.path().join("w.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("proj.weight".to_string(), Tensor::new(&[[1.0f32, 2.0]], &device)?.to_dtype(DType::F16)?);
        tensors.insert("proj.bias".to_string(), Tensor::new(&[0.5f32], &device)?);
        candle_core::safetensors::save(&tensors, &path)?;

        let weights = TrainableWeights::new("unet");
        let _layer = candle_nn::linear(2, 1, weights.var_builder(&device).pp("proj"))?;
        weights.init_from(&path, &device)?;

        let named = weights.named_vars();
        assert_eq!(named[0].0, "unet.proj.bias");
        assert_eq!(named[1].0, "unet.proj.weight");
        assert_eq!(named[1].1.dtype(), DType::F32);
        assert_eq!(named[1].1.as_tensor().to_vec2::<f32>()?, vec![vec![1.0, 2.0]]);
        assert_eq!(unprefixed(&named[1].0, "unet"), Some("proj.weight"));
        Ok(())
    }
}
