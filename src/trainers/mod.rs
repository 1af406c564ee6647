#[cfg(feature = "adam8bit")]
pub mod adam8bit;
pub mod adamw;
pub mod checkpoint;
pub mod config;
pub mod ddpm_scheduler;
pub mod distributed;
pub mod dream_trainer;
pub mod error;
pub mod lr_scheduler;
pub mod metrics;
pub mod optimization;
pub mod optimizer;
pub mod progress;

// Re-export key types
pub use config::{TrainArgs, TrainingConfig};
pub use ddpm_scheduler::DDPMScheduler;
pub use distributed::{DistributedRuntime, LocalRuntime, WorldInfo};
pub use dream_trainer::{DreamTrainer, TrainingPhase, TrainingSummary};
pub use error::TrainError;

use anyhow::Result;
use candle_core::Device;
use log::info;

/// Build a trainer from a resolved configuration and run it to completion
pub fn run(config: TrainingConfig, runtime: Box<dyn DistributedRuntime>, device: Device) -> Result<TrainingSummary> {
    info!("Training configuration: {}", config.summary());
    let mut trainer = DreamTrainer::from_config(config, runtime, device)?;
    trainer.train()
}
