use anyhow::Result;
use candle_core::Device;
use log::info;

use dreamtrainer::trainers::{self, LocalRuntime, TrainArgs, WorldInfo};

fn main() -> Result<()> {
    dreamtrainer::logging::init_logger();

    let args = TrainArgs::load()?;
    let world = WorldInfo::from_env(args.effective_local_rank())?;
    let config = args.resolve(&world)?;

    let device = Device::cuda_if_available(world.local_process_index)?;
    info!(
        "Process {}/{} on {:?}",
        world.process_index + 1,
        world.num_processes,
        device
    );

    let mut summary = trainers::run(config, Box::new(LocalRuntime::new(world)), device)?;
    info!(
        "Training completed: {} optimizer steps, {} checkpoints",
        summary.global_step,
        summary.checkpoints.len()
    );
    summary.wait_for_push();
    Ok(())
}
