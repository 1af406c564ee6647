use anyhow::Result;
use clap::Parser;
use log::info;
use rand::SeedableRng;
use std::path::PathBuf;

use dreamtrainer::loaders::{DataTextRealfake, RealfakeConfig, SampleOptions};
use dreamtrainer::{ModuleInterface, ModuleWrapper};

/// Draw real/tampered samples from a source tree and report throughput
#[derive(Parser, Debug)]
#[command(name = "realfake_sampler")]
struct Args {
    /// Root folder to walk
    folder_path: PathBuf,

    /// Number of samples to draw
    #[arg(short, long, default_value_t = 100)]
    n: usize,

    #[arg(long, default_value = "py")]
    extension: String,

    /// Print one rendered judge prompt before the run
    #[arg(long)]
    show_prompt: bool,

    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    dreamtrainer::logging::init_logger();
    let args = Args::parse();

    let config = RealfakeConfig {
        folder_path: args.folder_path,
        extension: args.extension,
    };
    let module = ModuleWrapper::new(DataTextRealfake::new(config)?);
    info!("{} exposes {:?}", module.module_path(), module.functions());

    let mut rng = match args.seed {
        Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
        None => rand::rngs::StdRng::from_entropy(),
    };

    if args.show_prompt {
        let sample = module.sample(&SampleOptions::default(), &mut rng)?;
        println!("{}", module.prompt(&sample)?);
    }

    let rate = module.throughput(args.n, &mut rng)?;
    info!("samples_per_second: {:.1}", rate);
    Ok(())
}
