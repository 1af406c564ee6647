pub mod dreambooth_dataset;
pub mod realfake;
pub mod tokenizer;

pub use dreambooth_dataset::{DataLoader, DreamBoothBatch, DreamBoothDataset, DreamBoothDatasetConfig};
pub use realfake::{DataTextRealfake, RealfakeConfig, RealfakeSample, SampleOptions};
pub use tokenizer::{ClipTokenizer, PromptTokenizer, CLIP_MAX_LENGTH};
