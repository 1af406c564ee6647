use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::clip;
use log::info;
use serde::Deserialize;
use std::path::Path;

use super::weights::{component_weights, frozen_var_builder, read_component_config, TrainableWeights};
use super::TextConditioner;
use crate::trainers::error::TrainError;
use crate::trainers::optimizer::NamedVar;

pub const TEXT_ENCODER_PREFIX: &str = "text_encoder";

/// Text encoder classes a DreamBooth pipeline may ship
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoderArchitecture {
    ClipTextModel,
    /// AltDiffusion's XLM-RoBERTa encoder
    RobertaSeriesModelWithTransformation,
}

impl TextEncoderArchitecture {
    pub fn from_class_name(name: &str) -> Result<Self, TrainError> {
        match name {
            "CLIPTextModel" => Ok(Self::ClipTextModel),
            "RobertaSeriesModelWithTransformation" => Ok(Self::RobertaSeriesModelWithTransformation),
            other => Err(TrainError::UnsupportedArchitecture(other.to_string())),
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            Self::ClipTextModel => "CLIPTextModel",
            Self::RobertaSeriesModelWithTransformation => "RobertaSeriesModelWithTransformation",
        }
    }

    /// Fails for classes recognised here but without a candle implementation
    pub fn ensure_loadable(&self) -> Result<(), TrainError> {
        match self {
            Self::ClipTextModel => Ok(()),
            Self::RobertaSeriesModelWithTransformation => Err(TrainError::UnsupportedArchitecture(format!(
                "{}: candle-transformers has no XLM-RoBERTa projection encoder; use a CLIPTextModel pipeline",
                self.class_name()
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextEncoderConfigFile {
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
}

fn default_hidden_size() -> usize {
    768
}

impl TextEncoderConfigFile {
    pub fn architecture(&self) -> Result<TextEncoderArchitecture, TrainError> {
        let name = self.architectures.first().map(String::as_str).unwrap_or_default();
        TextEncoderArchitecture::from_class_name(name)
    }

    /// candle CLIP preset for this hidden size
    pub fn clip_config(&self) -> Result<clip::Config, TrainError> {
        match self.hidden_size {
            768 => Ok(clip::Config::v1_5()),
            1024 => Ok(clip::Config::v2_1()),
            other => Err(TrainError::UnsupportedArchitecture(format!(
                "CLIP text encoder with hidden_size {}",
                other
            ))),
        }
    }
}

/// Read `text_encoder/config.json` and resolve its architecture
pub fn resolve_text_encoder(model_dir: &Path) -> Result<(TextEncoderArchitecture, TextEncoderConfigFile)> {
    let config: TextEncoderConfigFile = read_component_config(model_dir, "text_encoder")?;
    let architecture = config.architecture()?;
    architecture.ensure_loadable()?;
    Ok((architecture, config))
}

pub struct ClipTextConditioner {
    model: clip::ClipTextTransformer,
    architecture: TextEncoderArchitecture,
    trainable: Option<TrainableWeights>,
}

impl ClipTextConditioner {
    /// Frozen encoder in the training weight dtype
    pub fn load_frozen(
        model_dir: &Path,
        architecture: TextEncoderArchitecture,
        config: &TextEncoderConfigFile,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let path = component_weights(model_dir, "text_encoder")?;
        let vb = frozen_var_builder(&path, dtype, device)?;
        let model = clip::ClipTextTransformer::new(vb, &config.clip_config()?)?;
        info!("Loaded frozen {} ({:?})", architecture.class_name(), dtype);
        Ok(Self {
            model,
            architecture,
            trainable: None,
        })
    }

    /// Trainable encoder, f32 variables initialised from the pretrained weights
    pub fn load_trainable(
        model_dir: &Path,
        architecture: TextEncoderArchitecture,
        config: &TextEncoderConfigFile,
        device: &Device,
    ) -> Result<Self> {
        let path = component_weights(model_dir, "text_encoder")?;
        let weights = TrainableWeights::new(TEXT_ENCODER_PREFIX);
        let model = clip::ClipTextTransformer::new(weights.var_builder(device), &config.clip_config()?)?;
        weights.init_from(&path, device)?;
        info!(
            "Loaded trainable {} ({} tensors)",
            architecture.class_name(),
            weights.named_vars().len()
        );
        Ok(Self {
            model,
            architecture,
            trainable: Some(weights),
        })
    }

    pub fn architecture(&self) -> TextEncoderArchitecture {
        self.architecture
    }
}

impl TextConditioner for ClipTextConditioner {
    fn encode(&self, input_ids: &Tensor) -> Result<Tensor> {
        let hidden = self.model.forward(input_ids)?;
        Ok(hidden.to_dtype(DType::F32)?)
    }

    fn trainable_parameters(&self) -> Vec<NamedVar> {
        self.trainable.as_ref().map(|w| w.named_vars()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_dispatch() {
        assert_eq!(
            TextEncoderArchitecture::from_class_name("CLIPTextModel").unwrap(),
            TextEncoderArchitecture::ClipTextModel
        );
        let roberta = TextEncoderArchitecture::from_class_name("RobertaSeriesModelWithTransformation").unwrap();
        assert_eq!(roberta, TextEncoderArchitecture::RobertaSeriesModelWithTransformation);
        assert!(TextEncoderArchitecture::ClipTextModel.ensure_loadable().is_ok());
        assert!(roberta.ensure_loadable().is_err());

        for name in ["T5EncoderModel", "CLIPTextModelWithProjection"] {
            let err = TextEncoderArchitecture::from_class_name(name).unwrap_err();
            assert!(matches!(err, TrainError::UnsupportedArchitecture(ref n) if n == name));
        }
    }

    #[test]
    fn test_resolve_from_config_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("text_encoder"))?;
        std::fs::write(
            dir.path().join("text_encoder/config.json"),
            r#"{"architectures": ["CLIPTextModel"], "hidden_size": 1024, "num_hidden_layers": 23}"#,
        )?;
        let (arch, config) = resolve_text_encoder(dir.path())?;
        assert_eq!(arch, TextEncoderArchitecture::ClipTextModel);
        assert!(config.clip_config().is_ok());

        std::fs::write(
            dir.path().join("text_encoder/config.json"),
            r#"{"architectures": ["RobertaSeriesModelWithTransformation"]}"#,
        )?;
        let err = resolve_text_encoder(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::UnsupportedArchitecture(msg))
                if msg.starts_with("RobertaSeriesModelWithTransformation") && msg.contains("CLIPTextModel")
        ));
        Ok(())
    }

    #[test]
    fn test_unknown_hidden_size() {
        let config = TextEncoderConfigFile {
            architectures: vec!["CLIPTextModel".into()],
            hidden_size: 1280,
        };
        assert!(config.clip_config().is_err());
    }
}
