//! Instance and class images for DreamBooth, with the per-epoch data loader

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::tokenizer::PromptTokenizer;
use crate::trainers::config::TrainingConfig;
use crate::trainers::distributed::WorldInfo;
use crate::trainers::error::TrainError;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "bmp"];

#[derive(Debug, Clone)]
pub struct DreamBoothDatasetConfig {
    pub instance_data_dir: PathBuf,
    pub instance_prompt: String,
    /// Class images and prompt, set when prior preservation is on
    pub class_data: Option<(PathBuf, String)>,
    pub num_class_images: usize,
    pub resolution: usize,
    pub center_crop: bool,
}

impl DreamBoothDatasetConfig {
    pub fn from_training_config(config: &TrainingConfig) -> Self {
        Self {
            instance_data_dir: config.instance_data_dir.clone(),
            instance_prompt: config.instance_prompt.clone(),
            class_data: config
                .prior_preservation
                .as_ref()
                .map(|p| (p.class_data_dir.clone(), p.class_prompt.clone())),
            num_class_images: config
                .prior_preservation
                .as_ref()
                .map_or(0, |p| p.num_class_images),
            resolution: config.resolution,
            center_crop: config.center_crop,
        }
    }
}

/// One item before collation; pixel tensors are `(3, H, W)` f32 on the CPU
pub struct DreamBoothExample {
    pub instance_pixels: Tensor,
    pub class_pixels: Option<Tensor>,
}

pub struct DreamBoothDataset {
    instance_images: Vec<PathBuf>,
    class_images: Vec<PathBuf>,
    instance_prompt_ids: Vec<u32>,
    class_prompt_ids: Option<Vec<u32>>,
    resolution: usize,
    center_crop: bool,
}

pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).with_context(|| format!("Failed to read image directory: {}", dir.display()))?;
    let mut images = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .map_or(false, |ext| IMAGE_EXTENSIONS.contains(&ext.as_str()));
        if path.is_file() && is_image {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

impl DreamBoothDataset {
    pub fn new(config: &DreamBoothDatasetConfig, tokenizer: &dyn PromptTokenizer) -> Result<Self> {
        let instance_images = list_images(&config.instance_data_dir)?;
        if instance_images.is_empty() {
            return Err(TrainError::InvalidConfig(format!(
                "no instance images found in {}",
                config.instance_data_dir.display()
            ))
            .into());
        }

        let (class_images, class_prompt_ids) = match &config.class_data {
            Some((dir, prompt)) => {
                let images = if dir.exists() { list_images(dir)? } else { Vec::new() };
                if images.len() < config.num_class_images {
                    warn!(
                        "Only {} class images in {} (num_class_images = {}); class image generation is not available",
                        images.len(),
                        dir.display(),
                        config.num_class_images
                    );
                }
                if images.is_empty() {
                    return Err(
                        TrainError::InvalidConfig(format!("no class images found in {}", dir.display())).into(),
                    );
                }
                let images: Vec<PathBuf> = images.into_iter().take(config.num_class_images.max(1)).collect();
                (images, Some(tokenizer.encode_padded(prompt)?))
            }
            None => (Vec::new(), None),
        };

        info!(
            "Dataset: {} instance images, {} class images",
            instance_images.len(),
            class_images.len()
        );

        Ok(Self {
            instance_images,
            class_images,
            instance_prompt_ids: tokenizer.encode_padded(&config.instance_prompt)?,
            class_prompt_ids,
            resolution: config.resolution,
            center_crop: config.center_crop,
        })
    }

    pub fn len(&self) -> usize {
        self.instance_images.len().max(self.class_images.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_instance_images(&self) -> usize {
        self.instance_images.len()
    }

    pub fn num_class_images(&self) -> usize {
        self.class_images.len()
    }

    pub fn with_prior_preservation(&self) -> bool {
        self.class_prompt_ids.is_some()
    }

    pub fn instance_prompt_ids(&self) -> &[u32] {
        &self.instance_prompt_ids
    }

    pub fn class_prompt_ids(&self) -> Option<&[u32]> {
        self.class_prompt_ids.as_deref()
    }

    /// Item `index`: instance `index % n_instance`, class `index % n_class`
    pub fn get<R: Rng>(&self, index: usize, rng: &mut R) -> Result<DreamBoothExample> {
        let instance_path = &self.instance_images[index % self.instance_images.len()];
        let instance_pixels = self.load_pixels(instance_path, rng)?;
        let class_pixels = if self.class_images.is_empty() {
            None
        } else {
            let class_path = &self.class_images[index % self.class_images.len()];
            Some(self.load_pixels(class_path, rng)?)
        };
        Ok(DreamBoothExample {
            instance_pixels,
            class_pixels,
        })
    }

    fn load_pixels<R: Rng>(&self, path: &Path, rng: &mut R) -> Result<Tensor> {
        let img = image::open(path).with_context(|| format!("Failed to open image: {}", path.display()))?;
        let img = resize_and_crop(img, self.resolution, self.center_crop, rng);
        image_to_tensor(&img)
    }
}

/// Short side to `resolution`, then a square crop (centred or random)
pub fn resize_and_crop<R: Rng>(img: DynamicImage, resolution: usize, center_crop: bool, rng: &mut R) -> DynamicImage {
    let target = resolution as u32;
    let (width, height) = (img.width(), img.height());
    let scale = target as f32 / width.min(height) as f32;
    let new_width = ((width as f32 * scale).round() as u32).max(target);
    let new_height = ((height as f32 * scale).round() as u32).max(target);

    let img = img.resize_exact(new_width, new_height, FilterType::Triangle);

    let (crop_x, crop_y) = if center_crop {
        ((new_width - target) / 2, (new_height - target) / 2)
    } else {
        (rng.gen_range(0..=new_width - target), rng.gen_range(0..=new_height - target))
    };
    img.crop_imm(crop_x, crop_y, target, target)
}

/// RGB image to a `(3, H, W)` tensor in `[-1, 1]`
pub fn image_to_tensor(img: &DynamicImage) -> Result<Tensor> {
    let rgb = img.to_rgb8();
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let tensor = Tensor::from_vec(rgb.into_raw(), (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    Ok(((tensor / 127.5)? - 1.0)?)
}

/// Collated micro-batch, already on the training device
pub struct DreamBoothBatch {
    /// `(B, 3, H, W)`; with prior preservation the class half follows the instance half
    pub pixel_values: Tensor,
    /// u32 `(B, max_length)`
    pub input_ids: Tensor,
    /// Leading rows that are instance examples
    pub num_instance: usize,
}

/// Batches a dataset per epoch; after [`DataLoader::prepare`] each process
/// only walks its own share of the batches
pub struct DataLoader {
    dataset: Arc<DreamBoothDataset>,
    batch_size: usize,
    seed: u64,
    world: Option<WorldInfo>,
    device: Device,
}

impl DataLoader {
    pub fn new(dataset: Arc<DreamBoothDataset>, batch_size: usize, seed: u64, device: Device) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            seed,
            world: None,
            device,
        }
    }

    /// Shard batches round-robin across processes
    pub fn prepare(mut self, world: &WorldInfo) -> Self {
        self.world = Some(*world);
        self
    }

    pub fn dataset(&self) -> &DreamBoothDataset {
        &self.dataset
    }

    fn total_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Batches this process sees per epoch
    pub fn len(&self) -> usize {
        let total = self.total_batches();
        match &self.world {
            Some(world) => total.div_ceil(world.num_processes.max(1)),
            None => total,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dataset indices of every batch this process handles in `epoch`.
    /// The shuffle depends only on the seed and the epoch, so a resumed run
    /// sees the same order.
    pub fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        order.shuffle(&mut rng);
        let batches: Vec<Vec<usize>> = order.chunks(self.batch_size).map(<[usize]>::to_vec).collect();

        match &self.world {
            Some(world) if world.num_processes > 1 => {
                let total = batches.len();
                (0..self.len())
                    .map(|i| batches[(i * world.num_processes + world.process_index) % total].clone())
                    .collect()
            }
            _ => batches,
        }
    }

    /// Load and collate one batch; images are decoded in parallel
    pub fn load_batch(&self, indices: &[usize], rng: &mut StdRng) -> Result<DreamBoothBatch> {
        let seeds: Vec<u64> = indices.iter().map(|_| rng.gen()).collect();
        let examples = indices
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(&index, &seed)| self.dataset.get(index, &mut StdRng::seed_from_u64(seed)))
            .collect::<Result<Vec<_>>>()?;
        self.collate(examples)
    }

    fn collate(&self, examples: Vec<DreamBoothExample>) -> Result<DreamBoothBatch> {
        let num_instance = examples.len();
        let mut pixels = Vec::with_capacity(examples.len() * 2);
        let mut ids: Vec<u32> = Vec::new();

        for example in &examples {
            pixels.push(example.instance_pixels.clone());
            ids.extend_from_slice(self.dataset.instance_prompt_ids());
        }
        if let Some(class_ids) = self.dataset.class_prompt_ids() {
            for example in &examples {
                if let Some(class_pixels) = &example.class_pixels {
                    pixels.push(class_pixels.clone());
                    ids.extend_from_slice(class_ids);
                }
            }
        }

        let rows = pixels.len();
        let seq_len = self.dataset.instance_prompt_ids().len();
        let pixel_values = Tensor::stack(&pixels, 0)?.to_device(&self.device)?;
        let input_ids = Tensor::from_vec(ids, (rows, seq_len), &self.device)?;
        Ok(DreamBoothBatch {
            pixel_values,
            input_ids,
            num_instance,
        })
    }
}
