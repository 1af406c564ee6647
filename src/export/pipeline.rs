//! Final export: a diffusers-layout pipeline directory with the trained weights

use anyhow::{Context, Result};
use candle_core::Tensor;
use log::info;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::text_encoder::TEXT_ENCODER_PREFIX;
use crate::models::unet::UNET_PREFIX;
use crate::models::weights::unprefixed;
use crate::trainers::optimizer::NamedVar;

pub const UNET_WEIGHTS: &str = "diffusion_pytorch_model.safetensors";
pub const TEXT_ENCODER_WEIGHTS: &str = "model.safetensors";
const MODEL_INDEX: &str = "model_index.json";

pub struct PipelineExporter<'a> {
    pretrained_dir: &'a Path,
    output_dir: &'a Path,
    revision: Option<&'a str>,
}

impl<'a> PipelineExporter<'a> {
    pub fn new(pretrained_dir: &'a Path, output_dir: &'a Path, revision: Option<&'a str>) -> Self {
        Self {
            pretrained_dir,
            output_dir,
            revision,
        }
    }

    /// Write the pipeline. `trained` holds every trainable variable; the
    /// text encoder is copied unchanged when none of them belong to it.
    pub fn export(&self, trained: &[NamedVar]) -> Result<PathBuf> {
        fs::create_dir_all(self.output_dir)?;

        let unet = component_tensors(trained, UNET_PREFIX);
        let text_encoder = component_tensors(trained, TEXT_ENCODER_PREFIX);

        let mut written = Vec::new();
        for (component, tensors, file) in [
            ("unet", &unet, UNET_WEIGHTS),
            ("text_encoder", &text_encoder, TEXT_ENCODER_WEIGHTS),
        ] {
            if tensors.is_empty() {
                continue;
            }
            let target = self.output_dir.join(component);
            copy_configs(&self.pretrained_dir.join(component), &target)?;
            write_weights(tensors, &target.join(file))?;
            written.push(component);
        }

        let entries = fs::read_dir(self.pretrained_dir)
            .with_context(|| format!("Failed to read pretrained model: {}", self.pretrained_dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let source = entry.path();
            if source.is_dir() && !written.contains(&name.as_str()) {
                copy_dir(&source, &self.output_dir.join(&name))?;
            }
        }

        self.write_model_index()?;
        info!("Exported pipeline to {}", self.output_dir.display());
        Ok(self.output_dir.to_path_buf())
    }

    fn write_model_index(&self) -> Result<()> {
        let source = self.pretrained_dir.join(MODEL_INDEX);
        let mut index: serde_json::Value = if source.exists() {
            serde_json::from_str(&fs::read_to_string(&source)?)
                .with_context(|| format!("Failed to parse {}", source.display()))?
        } else {
            serde_json::json!({ "_class_name": "StableDiffusionPipeline" })
        };
        if let Some(map) = index.as_object_mut() {
            map.insert(
                "_name_or_path".to_string(),
                serde_json::Value::String(self.pretrained_dir.display().to_string()),
            );
            if let Some(revision) = self.revision {
                map.insert("_revision".to_string(), serde_json::Value::String(revision.to_string()));
            }
        }
        fs::write(self.output_dir.join(MODEL_INDEX), serde_json::to_string_pretty(&index)?)?;
        Ok(())
    }
}

fn component_tensors(trained: &[NamedVar], prefix: &str) -> HashMap<String, Tensor> {
    trained
        .iter()
        .filter_map(|(name, var)| unprefixed(name, prefix).map(|n| (n.to_string(), var.as_tensor().clone())))
        .collect()
}

fn write_weights(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    safetensors::serialize_to_file(tensors.iter(), &Some(metadata), path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn is_weight_file(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext == "safetensors" || ext == "bin" || ext == "ckpt")
}

/// Everything but weights, for components whose weights are rewritten
fn copy_configs(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;
    if !source.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(source)? {
        let path = entry?.path();
        if path.is_file() && !is_weight_file(&path) {
            if let Some(name) = path.file_name() {
                fs::copy(&path, target.join(name))?;
            }
        }
    }
    Ok(())
}

fn copy_dir(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let path = entry.path();
        let dest = target.join(entry.file_name());
        if path.is_dir() {
            copy_dir(&path, &dest)?;
        } else {
            fs::copy(&path, &dest).with_context(|| format!("Failed to copy {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn pretrained(root: &Path) -> Result<PathBuf> {
        let dir = root.join("sd");
        for component in ["unet", "text_encoder", "vae", "tokenizer", "scheduler"] {
            fs::create_dir_all(dir.join(component))?;
            fs::write(dir.join(component).join("config.json"), "{}")?;
        }
        fs::write(dir.join("unet").join(UNET_WEIGHTS), b"old")?;
        fs::write(dir.join("text_encoder").join(TEXT_ENCODER_WEIGHTS), b"frozen")?;
        fs::write(dir.join("vae").join(UNET_WEIGHTS), b"vae")?;
        fs::write(dir.join("tokenizer").join("tokenizer.json"), "{}")?;
        fs::write(dir.join(MODEL_INDEX), r#"{"_class_name": "StableDiffusionPipeline"}"#)?;
        Ok(dir)
    }

    #[test]
    fn test_export_layout_with_frozen_text_encoder() -> Result<()> {
        let root = tempfile::tempdir()?;
        let model = pretrained(root.path())?;
        let output = root.path().join("out");
        let trained = vec![("unet.conv_in.weight".to_string(), Var::new(&[1.0f32, 2.0], &Device::Cpu)?)];

        PipelineExporter::new(&model, &output, Some("fp16")).export(&trained)?;

        let unet = candle_core::safetensors::load(output.join("unet").join(UNET_WEIGHTS), &Device::Cpu)?;
        assert_eq!(unet["conv_in.weight"].to_vec1::<f32>()?, vec![1.0, 2.0]);
        assert!(output.join("unet/config.json").exists());
        assert_eq!(fs::read(output.join("text_encoder").join(TEXT_ENCODER_WEIGHTS))?, b"frozen");
        assert_eq!(fs::read(output.join("vae").join(UNET_WEIGHTS))?, b"vae");
        assert!(output.join("tokenizer/tokenizer.json").exists());
        assert!(output.join("scheduler/config.json").exists());

        let index: serde_json::Value = serde_json::from_str(&fs::read_to_string(output.join(MODEL_INDEX))?)?;
        assert_eq!(index["_revision"], "fp16");
        assert_eq!(index["_class_name"], "StableDiffusionPipeline");
        Ok(())
    }

    #[test]
    fn test_export_trained_text_encoder() -> Result<()> {
        let root = tempfile::tempdir()?;
        let model = pretrained(root.path())?;
        let output = root.path().join("out");
        let trained = vec![
            ("unet.w".to_string(), Var::new(&[0.0f32], &Device::Cpu)?),
            (
                "text_encoder.text_model.final_layer_norm.weight".to_string(),
                Var::new(&[3.0f32], &Device::Cpu)?,
            ),
        ];

        PipelineExporter::new(&model, &output, None).export(&trained)?;
        let encoder =
            candle_core::safetensors::load(output.join("text_encoder").join(TEXT_ENCODER_WEIGHTS), &Device::Cpu)?;
        assert!(encoder.contains_key("text_model.final_layer_norm.weight"));
        assert!(!encoder.contains_key("w"));
        Ok(())
    }
}
